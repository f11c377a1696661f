//! Bulk loading of table data from JSON or CSV files into an existing store.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use crate::store::RowStore;
use crate::utils::{
    error::{EngineResult, LoadError, StoreError},
    types::{DataType, Schema, Value},
};

/// Load a JSON file or a directory of CSV files, depending on what `path` is
pub fn load_path(store: &RowStore, path: impl AsRef<Path>) -> EngineResult<usize> {
    let path = path.as_ref();
    if path.is_dir() {
        return load_csv_dir(store, path);
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => load_json(store, path),
        _ => Err(LoadError::UnsupportedSource(path.display().to_string()).into()),
    }
}

/// Load `{"Table": [{"column": value, ...}, ...], ...}`, returning the number of rows inserted
pub fn load_json(store: &RowStore, path: impl AsRef<Path>) -> EngineResult<usize> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let document: serde_json::Value = serde_json::from_str(&content).map_err(|e| parse_error(path, e))?;

    let tables = document
        .as_object()
        .ok_or_else(|| parse_error(path, "top level must be an object keyed by table name"))?;

    let mut loaded = 0;
    for table in load_order(store, tables.keys().cloned().collect()) {
        let rows = match tables.get(&table).and_then(|rows| rows.as_array()) {
            Some(rows) => rows,
            None => return Err(parse_error(path, format!("{} must be an array of rows", table)).into()),
        };
        let schema = store.schema(&table)?;

        for (index, row) in rows.iter().enumerate() {
            let fields = row
                .as_object()
                .ok_or_else(|| parse_error(path, format!("{} row {} is not an object", table, index)))?;

            let mut values = Vec::with_capacity(fields.len());
            for (column, json) in fields {
                let data_type = column_type(&schema, column)?;
                let value = json_value(data_type, json)
                    .map_err(|message| parse_error(path, format!("{}.{}: {}", table, column, message)))?;
                values.push((column.as_str(), value));
            }
            store.insert_named(&table, &values)?;
        }

        debug!(table = %table, rows = rows.len(), "loaded json rows");
        loaded += rows.len();
    }

    Ok(loaded)
}

/// Load one `<Table>.csv` file per table from `dir`, returning the number of rows inserted
pub fn load_csv_dir(store: &RowStore, dir: impl AsRef<Path>) -> EngineResult<usize> {
    let dir = dir.as_ref();
    let mut files = HashMap::new();

    for entry in fs::read_dir(dir).map_err(|e| io_error(dir, e))? {
        let path = entry.map_err(|e| io_error(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        if let Some(table) = path.file_stem().and_then(|s| s.to_str()) {
            files.insert(table.to_string(), path.clone());
        }
    }

    let mut loaded = 0;
    for table in load_order(store, files.keys().cloned().collect()) {
        if let Some(path) = files.get(&table) {
            loaded += load_csv_file(store, &table, path)?;
        }
    }
    Ok(loaded)
}

fn load_csv_file(store: &RowStore, table: &str, path: &Path) -> EngineResult<usize> {
    let schema = store.schema(table)?;
    let mut reader = csv::Reader::from_path(path).map_err(|e| io_error(path, e))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| parse_error(path, e))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let types = headers
        .iter()
        .map(|h| column_type(&schema, h))
        .collect::<EngineResult<Vec<_>>>()?;

    let mut count = 0;
    for record in reader.records() {
        let record = record.map_err(|e| parse_error(path, e))?;
        let mut values = Vec::with_capacity(headers.len());

        for ((header, data_type), field) in headers.iter().zip(&types).zip(record.iter()) {
            let value = text_value(*data_type, field)
                .map_err(|message| parse_error(path, format!("{}.{}: {}", table, header, message)))?;
            values.push((header.as_str(), value));
        }
        store.insert_named(table, &values)?;
        count += 1;
    }

    debug!(table, rows = count, "loaded csv rows");
    Ok(count)
}

/// Order tables so that referenced tables load before the tables referencing them.
/// Tables the store does not know are skipped.
fn load_order(store: &RowStore, mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.retain(|name| {
        let known = store.has_table(name);
        if !known {
            warn!(table = %name, "skipping data for unknown table");
        }
        known
    });

    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    for name in &names {
        let references = store
            .schema(name)
            .map(|schema| {
                schema
                    .foreign_keys
                    .iter()
                    .map(|fk| fk.references.clone())
                    .filter(|target| target != name && names.contains(target))
                    .collect()
            })
            .unwrap_or_default();
        dependencies.insert(name.clone(), references);
    }

    let mut ordered: Vec<String> = Vec::with_capacity(names.len());
    while ordered.len() < names.len() {
        let ready: Vec<String> = names
            .iter()
            .filter(|name| !ordered.contains(name))
            .filter(|name| {
                dependencies
                    .get(*name)
                    .map_or(true, |deps| deps.iter().all(|dep| ordered.contains(dep)))
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            // Reference cycle: keep the remaining tables in name order
            let rest: Vec<String> = names.iter().filter(|n| !ordered.contains(n)).cloned().collect();
            ordered.extend(rest);
            break;
        }
        ordered.extend(ready);
    }
    ordered
}

fn column_type(schema: &Schema, column: &str) -> EngineResult<DataType> {
    schema
        .column(column)
        .map(|c| c.data_type)
        .ok_or_else(|| {
            StoreError::UnknownColumn {
                table: schema.name.clone(),
                column: column.to_string(),
            }
            .into()
        })
}

fn json_value(data_type: DataType, json: &serde_json::Value) -> Result<Value, String> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(data_type.coerce(Value::Integer(i))),
            (None, Some(f)) => Ok(Value::Float(f)),
            _ => Err(format!("unsupported number {}", n)),
        },
        serde_json::Value::String(s) if data_type == DataType::Text => Ok(Value::Text(s.clone())),
        serde_json::Value::String(s) => text_value(data_type, s),
        other => Err(format!("unsupported value {}", other)),
    }
}

/// Parse a textual field into the column's type; an empty field is null
fn text_value(data_type: DataType, text: &str) -> Result<Value, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Value::Null);
    }

    match data_type {
        DataType::Text => Ok(Value::Text(text.to_string())),
        DataType::Integer => text
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|e| format!("'{}' is not an integer: {}", text, e)),
        DataType::Float => text
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| format!("'{}' is not a number: {}", text, e)),
        DataType::Boolean => text
            .to_ascii_lowercase()
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|e| format!("'{}' is not a boolean: {}", text, e)),
    }
}

fn io_error(path: &Path, error: impl ToString) -> LoadError {
    LoadError::Io {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}

fn parse_error(path: &Path, error: impl ToString) -> LoadError {
    LoadError::Parse {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixture;

    #[test]
    fn test_text_value_parsing() {
        assert_eq!(text_value(DataType::Integer, " 42 ").unwrap(), Value::Integer(42));
        assert_eq!(text_value(DataType::Float, "2.5").unwrap(), Value::Float(2.5));
        assert_eq!(text_value(DataType::Boolean, "TRUE").unwrap(), Value::Boolean(true));
        assert_eq!(text_value(DataType::Text, "").unwrap(), Value::Null);
        assert!(text_value(DataType::Integer, "ten").is_err());
    }

    #[test]
    fn test_json_value_follows_column_type() {
        let json: serde_json::Value = serde_json::from_str(r#"[3, 1.5, "7", null]"#).unwrap();
        let items = json.as_array().unwrap();

        assert_eq!(json_value(DataType::Float, &items[0]).unwrap(), Value::Float(3.0));
        assert_eq!(json_value(DataType::Float, &items[1]).unwrap(), Value::Float(1.5));
        assert_eq!(json_value(DataType::Integer, &items[2]).unwrap(), Value::Integer(7));
        assert_eq!(json_value(DataType::Text, &items[3]).unwrap(), Value::Null);
    }

    #[test]
    fn test_load_order_puts_referenced_tables_first() {
        let store = RowStore::new();
        fixture::create_tables(&store).unwrap();

        let order = load_order(
            &store,
            vec!["Member".to_string(), "Club".to_string(), "Team".to_string()],
        );
        assert_eq!(order, vec!["Team".to_string(), "Member".to_string()]);
    }
}
