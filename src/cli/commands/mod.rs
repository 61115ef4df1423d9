pub mod import;
pub mod table;

pub use import::ImportCommand;
pub use table::{ScanCommand, TableArgs};

use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum Commands {
    /// Show how a foreign table maps onto its remote table
    Describe(TableArgs),
    /// Print the remote query for a scan without running it
    Translate(ScanCommand),
    /// Run a scan and print the rows
    Scan(ScanCommand),
    /// Generate CREATE FOREIGN TABLE statements for a dataset
    ImportSchema(ImportCommand),
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log filter directives, e.g. "bigquery_fdw_core=debug,reqwest=warn"
    #[arg(long = "log-filter", value_name = "FILTER", global = true)]
    pub log_filter: Option<String>,
}

impl LoggingOptions {
    pub fn get_effective_level(&self) -> String {
        match (&self.log_level, self.verbose) {
            (Some(level), _) => level.clone(),
            (None, 0) => "info".to_string(),
            (None, 1) => "debug".to_string(),
            (None, _) => "trace".to_string(),
        }
    }

    /// Filter directives applied when `--log-filter` is not given follow
    /// the effective level.
    pub fn filter_directives(&self) -> String {
        match &self.log_filter {
            Some(filter) => filter.clone(),
            None => format!("bigquery_fdw_core={}", self.get_effective_level()),
        }
    }
}
