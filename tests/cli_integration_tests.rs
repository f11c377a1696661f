use std::fs;
use std::process::Command;

/// Test helper to run CLI commands and capture output
fn run_cli_command(args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_memquery"))
        .args(args)
        .env("NO_COLOR", "1")
        .env("CLICOLOR", "0")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    (stdout, stderr, exit_code)
}

/// Test helper to check if output contains expected text
fn assert_output_contains(output: &str, expected: &str) {
    assert!(
        output.contains(expected),
        "Output did not contain expected text.\nExpected: {}\nActual output:\n{}",
        expected,
        output
    );
}

fn csv_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

#[test]
fn test_cli_help_command() {
    let (stdout, _stderr, exit_code) = run_cli_command(&["--help"]);

    assert_eq!(exit_code, 0);
    assert_output_contains(&stdout, "In-process relational query engine");
    assert_output_contains(&stdout, "Commands:");
    assert_output_contains(&stdout, "tables");
    assert_output_contains(&stdout, "scan");
    assert_output_contains(&stdout, "scenario");
}

#[test]
fn test_cli_version_command() {
    let (stdout, _stderr, exit_code) = run_cli_command(&["--version"]);

    assert_eq!(exit_code, 0);
    assert_output_contains(&stdout, "0.1.0");
}

#[test]
fn test_cli_tables_command() {
    let (stdout, _stderr, exit_code) = run_cli_command(&["tables"]);

    assert_eq!(exit_code, 0);
    assert_output_contains(&stdout, "Tables:");
    assert_output_contains(&stdout, "Member");
    assert_output_contains(&stdout, "Team");
    assert_output_contains(&stdout, "team_id");
}

#[test]
fn test_cli_scan_csv() {
    let (stdout, _stderr, exit_code) = run_cli_command(&["scan", "Member", "--format", "csv"]);

    assert_eq!(exit_code, 0);
    assert_eq!(
        csv_lines(&stdout),
        vec![
            "member.id,member.username,member.age,member.team_id",
            "1,member1,10,1",
            "2,member2,20,1",
            "3,member3,30,2",
            "4,member4,40,2",
        ]
    );
}

#[test]
fn test_cli_scan_unknown_table() {
    let (_stdout, stderr, exit_code) = run_cli_command(&["scan", "Club"]);

    assert_eq!(exit_code, 1);
    assert_output_contains(&stderr, "Error:");
    assert_output_contains(&stderr, "Club");
}

#[test]
fn test_cli_scenario_list() {
    let (stdout, _stderr, exit_code) = run_cli_command(&["scenario", "--list"]);

    assert_eq!(exit_code, 0);
    assert_output_contains(&stdout, "Scenarios:");
    for name in ["search", "sort", "paging", "group", "theta_join", "fetch_join", "subquery_in", "complex_case"] {
        assert_output_contains(&stdout, name);
    }
}

#[test]
fn test_cli_scenario_sort() {
    let (stdout, _stderr, exit_code) = run_cli_command(&["scenario", "sort", "--format", "csv"]);

    assert_eq!(exit_code, 0);
    let lines = csv_lines(&stdout);
    assert_eq!(lines.len(), 4);
    assert!(lines[1].contains("member5"));
    assert!(lines[2].contains("member6"));
    assert!(lines[3].contains("NULL"));
}

#[test]
fn test_cli_scenario_group_json() {
    let (stdout, _stderr, exit_code) = run_cli_command(&["scenario", "group", "--format", "json"]);

    assert_eq!(exit_code, 0);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let data = parsed["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["team.name"], "teamA");
    assert_eq!(data[0]["avg(member.age)"], 15.0);
    assert_eq!(data[1]["avg(member.age)"], 35.0);
}

#[test]
fn test_cli_scenario_paging_summary() {
    let (stdout, stderr, exit_code) = run_cli_command(&["scenario", "paging", "--format", "csv"]);

    assert_eq!(exit_code, 0);
    assert_eq!(csv_lines(&stdout).len(), 3);
    assert_output_contains(&stderr, "total 4, limit 2, offset 1");
}

#[test]
fn test_cli_unknown_scenario() {
    let (_stdout, stderr, exit_code) = run_cli_command(&["scenario", "nope"]);

    assert_eq!(exit_code, 1);
    assert_output_contains(&stderr, "Unknown scenario");
}

#[test]
fn test_cli_loads_json_data() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data.json");
    fs::write(
        &data,
        r#"{
            "Member": [{"id": 7, "username": "solo", "age": 33, "team_id": 3}],
            "Team": [{"id": 3, "name": "teamZ"}]
        }"#,
    )
    .unwrap();

    let (stdout, _stderr, exit_code) =
        run_cli_command(&["scan", "Member", "--format", "csv", "--data", data.to_str().unwrap()]);

    assert_eq!(exit_code, 0);
    assert_eq!(csv_lines(&stdout), vec!["member.id,member.username,member.age,member.team_id", "7,solo,33,3"]);
}

#[test]
fn test_cli_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("memquery.json");
    fs::write(&config, r#"{"output": {"default_format": "yaml"}}"#).unwrap();

    let (_stdout, stderr, exit_code) = run_cli_command(&["tables", "--config", config.to_str().unwrap()]);

    assert_eq!(exit_code, 1);
    assert_output_contains(&stderr, "Configuration error");
}
