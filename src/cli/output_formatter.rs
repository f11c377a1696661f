use colored::*;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use crate::cli::cli_args::OutputFormat;
use crate::utils::{
    error::{EngineError, EngineResult},
    types::{QueryResult, Value},
};

const NULL_TEXT: &str = "NULL";
const MIN_COLUMN_WIDTH: usize = 4;

/// Renders a [`QueryResult`] for the terminal
pub struct OutputFormatter;

impl OutputFormatter {
    pub fn format_result(result: &QueryResult, format: OutputFormat) -> EngineResult<String> {
        match format {
            OutputFormat::Table => Ok(Self::format_table(result)),
            OutputFormat::Json => Self::format_json(result),
            OutputFormat::Csv => Self::format_csv(result),
        }
    }

    /// Boxed table with a row-count footer; floats keep their full precision
    fn format_table(result: &QueryResult) -> String {
        if result.is_empty() {
            return "No results found.".dimmed().to_string();
        }

        let cells: Vec<Vec<String>> = result
            .rows
            .iter()
            .map(|row| row.values.iter().map(plain_text).collect())
            .collect();

        let widths: Vec<usize> = result
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                cells
                    .iter()
                    .filter_map(|row| row.get(i))
                    .map(|cell| cell.chars().count())
                    .chain([col.name.chars().count(), MIN_COLUMN_WIDTH])
                    .max()
                    .unwrap_or(MIN_COLUMN_WIDTH)
            })
            .collect();

        let rule = rule_line(&widths);
        let mut output = rule.clone();

        let header: Vec<String> = result
            .columns
            .iter()
            .zip(&widths)
            .map(|(col, width)| pad(col.name.bold().cyan(), &col.name, *width))
            .collect();
        output.push_str(&format!("| {} |\n", header.join(" | ")));
        output.push_str(&rule);

        for (row, texts) in result.rows.iter().zip(&cells) {
            let line: Vec<String> = row
                .values
                .iter()
                .zip(texts)
                .zip(&widths)
                .map(|((value, text), width)| pad(colored_value(value, text), text, *width))
                .collect();
            output.push_str(&format!("| {} |\n", line.join(" | ")));
        }
        output.push_str(&rule);

        let count = result.row_count();
        output.push_str(&format!(
            "\n{} {} in {:.3}ms\n",
            count.to_string().green().bold(),
            if count == 1 { "row" } else { "rows" },
            result.execution_time.as_secs_f64() * 1000.0
        ));
        output
    }

    /// Rows as objects keyed by column name; repeated names get a `#n` suffix
    fn format_json(result: &QueryResult) -> EngineResult<String> {
        let keys = unique_keys(result.columns.iter().map(|col| col.name.as_str()));

        let data: Vec<JsonValue> = result
            .rows
            .iter()
            .map(|row| {
                let object: Map<String, JsonValue> = keys
                    .iter()
                    .cloned()
                    .zip(row.values.iter().map(json_value))
                    .collect();
                JsonValue::Object(object)
            })
            .collect();

        let columns: Vec<JsonValue> = result
            .columns
            .iter()
            .zip(&keys)
            .map(|(col, key)| {
                json!({
                    "key": key,
                    "name": col.name,
                    "type": col.data_type.to_string(),
                    "nullable": col.nullable,
                })
            })
            .collect();

        let document = json!({
            "data": data,
            "metadata": {
                "columns": columns,
                "row_count": result.row_count(),
                "execution_time_ms": result.execution_time.as_secs_f64() * 1000.0,
            }
        });

        serde_json::to_string_pretty(&document)
            .map_err(|e| EngineError::Internal(format!("Failed to render JSON: {}", e)))
    }

    fn format_csv(result: &QueryResult) -> EngineResult<String> {
        let csv_error = |e: csv::Error| EngineError::Internal(format!("Failed to render CSV: {}", e));

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(result.columns.iter().map(|col| col.name.as_str()))
            .map_err(csv_error)?;
        for row in &result.rows {
            writer.write_record(row.values.iter().map(plain_text)).map_err(csv_error)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| EngineError::Internal(format!("Failed to render CSV: {}", e.error())))?;
        String::from_utf8(bytes).map_err(|e| EngineError::Internal(format!("CSV output is not UTF-8: {}", e)))
    }

    pub fn format_error(error: &EngineError) -> String {
        format!("{} {}", "Error:".red().bold(), error.to_string().red())
    }

    pub fn format_info(message: &str) -> String {
        format!("{} {}", "Info:".blue().bold(), message)
    }
}

/// Uncolored cell text; floats use the shortest exact form and always show a fraction
fn plain_text(value: &Value) -> String {
    match value {
        Value::Float(f) => format!("{:?}", f),
        Value::Null => NULL_TEXT.to_string(),
        other => other.to_string(),
    }
}

fn colored_value(value: &Value, text: &str) -> ColoredString {
    match value {
        Value::Integer(_) | Value::Float(_) => text.blue(),
        Value::Boolean(true) => text.green(),
        Value::Boolean(false) => text.red(),
        Value::Null => text.dimmed(),
        Value::Text(_) => text.normal(),
    }
}

/// Left-align by visible width; color codes would otherwise count towards `{:<w$}`
fn pad(styled: ColoredString, text: &str, width: usize) -> String {
    let fill = width.saturating_sub(text.chars().count());
    format!("{}{}", styled, " ".repeat(fill))
}

fn rule_line(widths: &[usize]) -> String {
    let segments: Vec<String> = widths.iter().map(|w| "-".repeat(w + 2)).collect();
    format!("+{}+\n", segments.join("+"))
}

fn unique_keys<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    names
        .map(|name| {
            let n = seen.entry(name).or_insert(0);
            *n += 1;
            if *n == 1 {
                name.to_string()
            } else {
                format!("{}#{}", name, n)
            }
        })
        .collect()
}

fn json_value(value: &Value) -> JsonValue {
    match value {
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Integer(i) => JsonValue::from(*i),
        // NaN and infinities have no JSON number form
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Null => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::{ColumnMetadata, DataType, Row};
    use std::time::Duration;

    fn result(columns: Vec<ColumnMetadata>, rows: Vec<Vec<Value>>) -> QueryResult {
        QueryResult {
            columns,
            rows: rows.into_iter().map(Row::new).collect(),
            execution_time: Duration::from_millis(1),
        }
    }

    fn averages() -> QueryResult {
        result(
            vec![
                ColumnMetadata::new("team.name", DataType::Text, true),
                ColumnMetadata::new("avg(member.age)", DataType::Float, true),
            ],
            vec![
                vec![Value::from("teamA"), Value::Float(25.125)],
                vec![Value::Null, Value::Float(35.0)],
            ],
        )
    }

    #[test]
    fn test_csv_keeps_float_precision() {
        let output = OutputFormatter::format_result(&averages(), OutputFormat::Csv).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines, vec!["team.name,avg(member.age)", "teamA,25.125", "NULL,35.0"]);
    }

    #[test]
    fn test_csv_quotes_special_fields() {
        let quoted = result(
            vec![ColumnMetadata::new("member.username", DataType::Text, true)],
            vec![vec![Value::from("a,b")], vec![Value::from("say \"hi\"")]],
        );
        let output = OutputFormatter::format_result(&quoted, OutputFormat::Csv).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines[1], "\"a,b\"");
        assert_eq!(lines[2], "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_json_rows_and_metadata() {
        let output = OutputFormatter::format_result(&averages(), OutputFormat::Json).unwrap();
        let parsed: JsonValue = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["data"][0]["team.name"], "teamA");
        assert_eq!(parsed["data"][0]["avg(member.age)"], 25.125);
        assert!(parsed["data"][1]["team.name"].is_null());
        assert_eq!(parsed["metadata"]["row_count"], 2);
        assert_eq!(parsed["metadata"]["columns"][1]["type"], "FLOAT");
    }

    #[test]
    fn test_json_repeated_column_names_are_kept() {
        let repeated = result(
            vec![
                ColumnMetadata::new("member.age", DataType::Integer, false),
                ColumnMetadata::new("member.age", DataType::Integer, false),
            ],
            vec![vec![Value::Integer(10), Value::Integer(20)]],
        );
        let output = OutputFormatter::format_result(&repeated, OutputFormat::Json).unwrap();
        let parsed: JsonValue = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["data"][0]["member.age"], 10);
        assert_eq!(parsed["data"][0]["member.age#2"], 20);
        assert_eq!(parsed["metadata"]["columns"][1]["key"], "member.age#2");
        assert_eq!(parsed["metadata"]["columns"][1]["name"], "member.age");
    }

    #[test]
    fn test_table_layout() {
        colored::control::set_override(false);
        let output = OutputFormatter::format_result(&averages(), OutputFormat::Table).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines[0], "+-----------+-----------------+");
        assert_eq!(lines[1], "| team.name | avg(member.age) |");
        assert_eq!(lines[3], "| teamA     | 25.125          |");
        assert_eq!(lines[4], "| NULL      | 35.0            |");
        assert!(output.contains("2 rows in"));
    }

    #[test]
    fn test_empty_table() {
        colored::control::set_override(false);
        let output = OutputFormatter::format_result(&QueryResult::new(), OutputFormat::Table).unwrap();
        assert_eq!(output, "No results found.");
    }
}
