use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use crate::utils::error::{EngineError, EngineResult};

/// Main engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub query: QueryConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub output: OutputConfig,
}

/// Query execution configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Null placement for order specifiers without an explicit policy
    pub default_null_ordering: NullOrderingDefault,
}

/// Where nulls sort when an order specifier does not say
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum NullOrderingDefault {
    /// Nulls compare above every value: last when ascending, first when descending
    NullsLargest,
    /// Nulls compare below every value: first when ascending, last when descending
    NullsSmallest,
}

/// Row store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// First primary key handed out for rows inserted without an id
    pub auto_increment_start: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub with_target: bool,
}

/// CLI output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub default_format: String,
}

impl EngineConfig {
    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&content).map_err(|e| {
            EngineError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> EngineResult<()> {
        if self.store.auto_increment_start < 1 {
            return Err(EngineError::Configuration(
                "store.auto_increment_start must be at least 1".to_string(),
            ));
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !["trace", "debug", "info", "warn", "error", "off"].contains(&level.as_str()) {
            return Err(EngineError::Configuration(format!(
                "Unknown logging level: {}",
                self.logging.level
            )));
        }

        if !["table", "json", "csv"].contains(&self.output.default_format.as_str()) {
            return Err(EngineError::Configuration(format!(
                "Unknown output format: {}",
                self.output.default_format
            )));
        }

        Ok(())
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_null_ordering: NullOrderingDefault::NullsLargest,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            auto_increment_start: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            with_target: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_format: "table".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();

        assert_eq!(config.query.default_null_ordering, NullOrderingDefault::NullsLargest);
        assert_eq!(config.store.auto_increment_start, 1);
        assert_eq!(config.logging.level, "warn");
        assert!(!config.logging.with_target);
        assert_eq!(config.output.default_format, "table");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"query": {"default_null_ordering": "NullsSmallest"}}"#).unwrap();

        assert_eq!(config.query.default_null_ordering, NullOrderingDefault::NullsSmallest);
        assert_eq!(config.store.auto_increment_start, 1);
        assert_eq!(config.output.default_format, "table");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.store.auto_increment_start = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.logging.level = "chatty".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.output.default_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"store": {{"auto_increment_start": 100}}, "logging": {{"level": "debug"}}}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store.auto_increment_start, 100);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_file_missing() {
        match EngineConfig::from_file("/nonexistent/memquery.json") {
            Err(EngineError::Configuration(msg)) => assert!(msg.contains("Failed to read")),
            other => panic!("Expected Configuration error, got {:?}", other),
        }
    }
}
