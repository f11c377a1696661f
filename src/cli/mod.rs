// CLI interface components
pub mod cli_args;
pub mod cli_runner;
pub mod output_formatter;
pub mod scenarios;

pub use cli_args::*;
pub use cli_runner::*;
pub use output_formatter::*;
