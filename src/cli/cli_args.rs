use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// memquery CLI - run fluent queries over an in-memory Member/Team data set
#[derive(Parser, Debug)]
#[command(name = "memquery")]
#[command(about = "In-process relational query engine with a type-safe query builder")]
#[command(version = "0.1.0")]
pub struct CliArgs {
    /// Engine configuration file (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Data to load: a JSON file or a directory of CSV files. Defaults to the built-in fixture
    #[arg(long, global = true, value_name = "PATH")]
    pub data: Option<PathBuf>,

    /// Output format; overrides the configured default
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List tables with their columns and keys
    Tables,

    /// Print every row of a table
    Scan {
        /// Table name, e.g. "Member"
        table: String,
    },

    /// Run a named built-in query
    Scenario {
        /// Scenario name (see --list)
        #[arg(required_unless_present = "list")]
        name: Option<String>,

        /// List the available scenarios
        #[arg(long)]
        list: bool,
    },
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Formatted table output
    Table,
    /// JSON output
    Json,
    /// CSV output
    Csv,
}

impl OutputFormat {
    /// Resolve a configured format name
    pub fn from_name(name: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(name, true).ok()
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario_with_globals() {
        let args = CliArgs::parse_from(["memquery", "scenario", "paging", "--format", "json", "-v"]);

        assert_eq!(args.format, Some(OutputFormat::Json));
        assert!(args.verbose);
        match args.command {
            Commands::Scenario { name, list } => {
                assert_eq!(name.as_deref(), Some("paging"));
                assert!(!list);
            }
            other => panic!("Expected Scenario command, got {:?}", other),
        }
    }

    #[test]
    fn test_scenario_requires_name_or_list() {
        assert!(CliArgs::try_parse_from(["memquery", "scenario"]).is_err());
        assert!(CliArgs::try_parse_from(["memquery", "scenario", "--list"]).is_ok());
    }

    #[test]
    fn test_format_from_name() {
        assert_eq!(OutputFormat::from_name("CSV"), Some(OutputFormat::Csv));
        assert_eq!(OutputFormat::from_name("xml"), None);
    }
}
