//! bigquery-fdw binary.
//!
//! Operator tool for inspecting foreign tables: describe the column
//! mapping, print translated queries, run scans and generate schema
//! imports against BigQuery.

use anyhow::Context;
use bigquery_fdw_core::{
    cli::commands::{Commands, LoggingOptions},
    cli::handlers::{build_service, handle_describe, handle_import_schema, handle_scan, handle_translate},
    config::{Args, FdwConfig},
};
use clap::Parser;
use tracing::debug;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub args: Args,

    #[command(flatten)]
    pub logging: LoggingOptions,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so scan output stays clean
    let level = cli.logging.get_effective_level();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.parse().unwrap_or(LevelFilter::INFO).into())
                .parse_lossy(cli.logging.filter_directives()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = FdwConfig::load(&cli.args).context("Failed to load configuration")?;
    debug!(project = %config.bigquery.project, "Configuration loaded");
    let fdw = build_service(config)?;

    match &cli.command {
        Commands::Describe(args) => handle_describe(&fdw, args).await?,
        Commands::Translate(cmd) => handle_translate(&fdw, cmd).await?,
        Commands::Scan(cmd) => handle_scan(&fdw, cmd).await?,
        Commands::ImportSchema(cmd) => handle_import_schema(&fdw, cmd).await?,
    }

    Ok(())
}
