use clap::Parser;
use colored::*;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;
use crate::cli::{scenarios, CliArgs, Commands, OutputFormat, OutputFormatter};
use crate::engine::{engine::{Engine, EngineBuilder}, expression::EntityPath};
use crate::store::{fixture, loader};
use crate::utils::{
    config::{EngineConfig, LoggingConfig},
    error::{EngineError, EngineResult},
};

/// Main CLI runner that handles command execution
pub struct CliRunner {
    engine: Engine,
    format: OutputFormat,
    builtin_data: bool,
}

impl CliRunner {
    /// Build an engine over the Member/Team tables, filled from `data` or the built-in fixture
    pub fn new(config: EngineConfig, data: Option<&Path>, format: Option<OutputFormat>) -> EngineResult<Self> {
        let format = match format {
            Some(format) => format,
            None => OutputFormat::from_name(&config.output.default_format).ok_or_else(|| {
                EngineError::Configuration(format!("Unknown output format: {}", config.output.default_format))
            })?,
        };

        let engine = EngineBuilder::new().with_config(config).build()?;
        fixture::create_tables(engine.store())?;

        match data {
            Some(path) => {
                let rows = loader::load_path(engine.store(), path)?;
                info!(path = %path.display(), rows, "loaded data");
            }
            None => fixture::seed(engine.store())?,
        }

        Ok(Self {
            engine,
            format,
            builtin_data: data.is_none(),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Describe every table: columns, primary key and associations
    pub fn list_tables(&self) -> EngineResult<String> {
        let store = self.engine.store();
        let mut output = String::new();
        output.push_str(&format!("{}\n", "Tables:".bold()));

        for name in store.table_names() {
            let schema = store.schema(&name)?;
            output.push_str(&format!(
                "  {} {} ({} rows)\n",
                "•".green(),
                name.cyan().bold(),
                store.row_count(&name)?
            ));
            output.push_str(&format!("    Primary Key: {}\n", schema.primary_key.yellow()));

            for col in &schema.columns {
                let nullable_colored = if col.nullable { "NULL".yellow() } else { "NOT NULL".green() };
                output.push_str(&format!(
                    "    {} {} {}\n",
                    col.name.cyan(),
                    col.data_type.to_string().blue(),
                    nullable_colored
                ));
            }

            for fk in &schema.foreign_keys {
                output.push_str(&format!(
                    "    {} {} -> {} via {}\n",
                    "Association".magenta(),
                    fk.association.cyan(),
                    fk.references.cyan(),
                    fk.column
                ));
            }
        }

        Ok(output)
    }

    /// Print every row of one table
    pub fn scan_table(&self, table: &str) -> EngineResult<String> {
        let path = EntityPath::new(table, &table.to_lowercase());
        let result = self.engine.select_from(&path).fetch_result_set()?;
        info!(table, rows = result.row_count(), "scanned table");
        OutputFormatter::format_result(&result, self.format)
    }

    pub fn list_scenarios() -> String {
        let mut output = String::new();
        output.push_str(&format!("{}\n", "Scenarios:".bold()));
        for scenario in scenarios::SCENARIOS {
            output.push_str(&format!(
                "  {} {:<20} {}\n",
                "•".green(),
                scenario.name.cyan(),
                scenario.description
            ));
        }
        output
    }

    pub fn run_scenario(&self, name: &str) -> EngineResult<String> {
        let scenario = scenarios::find(name).ok_or_else(|| {
            EngineError::Configuration(format!(
                "Unknown scenario '{}'; run `memquery scenario --list`",
                name
            ))
        })?;

        info!(scenario = name, "running scenario");
        let output = scenario.run(&self.engine, self.builtin_data)?;

        let mut rendered = OutputFormatter::format_result(&output.result, self.format)?;
        if let Some(summary) = output.summary {
            if self.format == OutputFormat::Table {
                rendered.push_str(&OutputFormatter::format_info(&summary));
                rendered.push('\n');
            } else {
                eprintln!("{}", OutputFormatter::format_info(&summary));
            }
        }
        Ok(rendered)
    }
}

/// Install the tracing subscriber: `RUST_LOG` wins, then `-v`, then the configured level
pub fn init_logging(config: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // A subscriber may already be installed when embedded; keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_writer(std::io::stderr)
        .try_init();
}

fn exit_with(error: &EngineError) -> ! {
    eprintln!("{}", OutputFormatter::format_error(error));
    std::process::exit(1);
}

/// Main entry point for CLI execution
pub fn run_cli() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path).unwrap_or_else(|e| exit_with(&e)),
        None => EngineConfig::default(),
    };
    init_logging(&config.logging, args.verbose);

    if let Commands::Scenario { list: true, .. } = &args.command {
        println!("{}", CliRunner::list_scenarios());
        return Ok(());
    }

    let runner = CliRunner::new(config, args.data.as_deref(), args.format).unwrap_or_else(|e| exit_with(&e));

    let output = match &args.command {
        Commands::Tables => runner.list_tables(),
        Commands::Scan { table } => runner.scan_table(table),
        Commands::Scenario { name: Some(name), .. } => runner.run_scenario(name),
        Commands::Scenario { name: None, .. } => Ok(CliRunner::list_scenarios()),
    };

    match output {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => exit_with(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> CliRunner {
        CliRunner::new(EngineConfig::default(), None, Some(OutputFormat::Csv)).unwrap()
    }

    #[test]
    fn test_scan_table_csv() {
        let output = runner().scan_table("Team").unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["team.id,team.name", "1,teamA", "2,teamB"]);
    }

    #[test]
    fn test_scan_unknown_table() {
        match runner().scan_table("Club") {
            Err(EngineError::Plan(_)) => {}
            other => panic!("Expected Plan error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_list_tables_mentions_association() {
        colored::control::set_override(false);
        let output = runner().list_tables().unwrap();
        assert!(output.contains("Member"));
        assert!(output.contains("team -> Team via team_id"));
    }

    #[test]
    fn test_unknown_scenario() {
        match runner().run_scenario("nope") {
            Err(EngineError::Configuration(msg)) => assert!(msg.contains("nope")),
            other => panic!("Expected Configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_configured_format_is_validated() {
        let mut config = EngineConfig::default();
        config.output.default_format = "yaml".to_string();
        assert!(CliRunner::new(config, None, None).is_err());
    }
}
