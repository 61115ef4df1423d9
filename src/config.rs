//! Configuration management for the BigQuery foreign data wrapper.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/bigquery-fdw/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `BIGQUERY_FDW_`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! Per-table behaviour is controlled separately through the foreign table's
//! `fdw_*` options, parsed by [`TableOptions::from_options`].
//!
//! # Environment Variables
//!
//! - `GOOGLE_APPLICATION_CREDENTIALS` - Service account key used when no key
//!   path is configured
//! - `BIGQUERY_FDW_BIGQUERY__PROJECT` - Project that runs the query jobs

use crate::error::{FdwError, Result};
use crate::schema::types::{parse_cast_target, RemoteType};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Environment variable consulted for the default service account key.
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Command-line arguments
#[derive(Debug, Parser, Default, Clone)]
#[clap(version, about)]
pub struct Args {
    /// Configuration file path
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Project that runs query jobs
    #[clap(long, env = "BIGQUERY_FDW_PROJECT")]
    pub project: Option<String>,

    /// Default dataset for foreign tables
    #[clap(long, env = "BIGQUERY_FDW_DATASET")]
    pub dataset: Option<String>,

    /// Service account key file
    #[clap(long = "key", env = "BIGQUERY_FDW_KEY")]
    pub key_path: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[clap(long)]
    pub timeout_secs: Option<u64>,

    /// Rows fetched per result page
    #[clap(long)]
    pub page_size: Option<u32>,

    /// Maximum backoff between polls in milliseconds
    #[clap(long)]
    pub max_backoff_ms: Option<u64>,
}

/// SQL dialect used for generated queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Standard,
    Legacy,
}

impl SqlDialect {
    /// Parse a dialect name, falling back to standard SQL for anything
    /// unrecognized.
    pub fn parse_lossy(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "standard" => SqlDialect::Standard,
            "legacy" => SqlDialect::Legacy,
            other => {
                warn!(dialect = other, "Unknown SQL dialect, falling back to standard");
                SqlDialect::Standard
            }
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, SqlDialect::Legacy)
    }
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FdwConfig {
    /// Remote warehouse settings
    #[serde(default)]
    pub bigquery: BigQueryConfig,
    /// Query execution settings
    #[serde(default)]
    pub query: QueryConfig,
    /// Credential lifecycle settings
    #[serde(default)]
    pub credentials: CredentialConfig,
}

/// Remote warehouse settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigQueryConfig {
    /// Project that runs query jobs (and the default table project)
    #[serde(default)]
    pub project: String,
    /// Default dataset
    #[serde(default)]
    pub dataset: String,
    /// Job location, e.g. `US` or `europe-west2`
    #[serde(default)]
    pub location: Option<String>,
    /// Service account key file
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// REST endpoint root
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            dataset: String::new(),
            location: None,
            key_path: None,
            api_endpoint: default_api_endpoint(),
        }
    }
}

/// Query execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default dialect for tables that do not set `fdw_sql_dialect`
    #[serde(default)]
    pub dialect: SqlDialect,
    /// Render literals as named query parameters (standard dialect only)
    #[serde(default)]
    pub parameterized: bool,
    /// Deadline for submission and polling of a single query, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Rows requested per result page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound for the best-effort job release on close, in milliseconds
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            dialect: SqlDialect::Standard,
            parameterized: false,
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            release_timeout_ms: default_release_timeout_ms(),
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

/// Credential lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Refresh credentials expiring within this many seconds
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    /// Requested lifetime of signed assertions
    #[serde(default = "default_token_lifetime_secs")]
    pub token_lifetime_secs: u64,
    /// OAuth scope requested for access tokens
    #[serde(default = "default_scope")]
    pub scope: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: default_refresh_margin_secs(),
            token_lifetime_secs: default_token_lifetime_secs(),
            scope: default_scope(),
        }
    }
}

impl FdwConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/bigquery-fdw/config.toml").required(false));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("BIGQUERY_FDW")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut config: FdwConfig = builder.build()?.try_deserialize()?;

        // Override with command line args
        if let Some(project) = &args.project {
            config.bigquery.project = project.clone();
        }
        if let Some(dataset) = &args.dataset {
            config.bigquery.dataset = dataset.clone();
        }
        if let Some(key) = &args.key_path {
            config.bigquery.key_path = Some(key.clone());
        }
        if let Some(timeout) = args.timeout_secs {
            config.query.timeout_secs = timeout;
        }
        if let Some(page_size) = args.page_size {
            config.query.page_size = page_size;
        }
        if let Some(max_backoff) = args.max_backoff_ms {
            config.query.max_backoff_ms = max_backoff;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the executor unbounded or useless.
    pub fn validate(&self) -> Result<()> {
        if self.query.page_size == 0 {
            return Err(FdwError::Config("query.page_size must be positive".into()));
        }
        if self.query.timeout_secs == 0 {
            return Err(FdwError::Config("query.timeout_secs must be positive".into()));
        }
        if self.query.initial_backoff_ms == 0
            || self.query.max_backoff_ms < self.query.initial_backoff_ms
        {
            return Err(FdwError::Config(
                "query backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the service account key: explicit setting first, then the
    /// standard Google environment variable.
    pub fn key_path(&self) -> Option<PathBuf> {
        self.bigquery
            .key_path
            .clone()
            .or_else(|| env::var_os(CREDENTIALS_ENV).filter(|v| !v.is_empty()).map(PathBuf::from))
    }
}

/// What to do when imported tables exceed host column limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitPolicy {
    /// Drop the offending table (column count) or column (name length)
    #[default]
    Skip,
    /// Keep what fits
    Trim,
    /// Fail the whole import
    Error,
}

impl LimitPolicy {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(LimitPolicy::Skip),
            "trim" => Ok(LimitPolicy::Trim),
            "error" => Ok(LimitPolicy::Error),
            other => Err(FdwError::Config(format!(
                "invalid limit policy '{}', expected skip, trim or error",
                other
            ))),
        }
    }
}

/// Per-table options recognised on a foreign table definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableOptions {
    pub dialect: SqlDialect,
    /// Push `GROUP BY` and expose `_fdw_count`
    pub group_by: bool,
    /// Column → cast target
    pub casting: HashMap<String, RemoteType>,
    /// Convert TIMESTAMP columns declared as date/timestamp to this zone
    pub convert_tz: Option<String>,
    /// Log generated SQL at info level
    pub verbose: bool,
    /// Render literals as query parameters
    pub parameterized: bool,
    /// Key file overriding the server-wide one
    pub key_path: Option<PathBuf>,
}

impl TableOptions {
    /// Parse the `fdw_*` options of a foreign table.
    ///
    /// Options that cannot be honoured are ignored with a warning, matching
    /// how a table definition keeps working when an optional tweak is wrong.
    pub fn from_options(options: &HashMap<String, String>, defaults: &QueryConfig) -> Result<Self> {
        let dialect = options
            .get("fdw_sql_dialect")
            .map(|d| SqlDialect::parse_lossy(d))
            .unwrap_or(defaults.dialect);

        let group_by = options.get("fdw_group").map(|v| parse_bool(v)).unwrap_or(false);
        let verbose = options.get("fdw_verbose").map(|v| parse_bool(v)).unwrap_or(false);
        let parameterized = options
            .get("fdw_parameterized")
            .map(|v| parse_bool(v))
            .unwrap_or(defaults.parameterized);

        let casting = match options.get("fdw_casting") {
            Some(raw) => parse_casting(raw, dialect)?,
            None => HashMap::new(),
        };

        let convert_tz = match options.get("fdw_convert_tz").map(|tz| tz.trim()) {
            Some(tz) if !tz.is_empty() => {
                validate_time_zone(tz)?;
                Some(tz.to_string())
            }
            _ => None,
        };

        Ok(Self {
            dialect,
            group_by,
            casting,
            convert_tz,
            verbose,
            parameterized,
            key_path: options.get("fdw_key").map(PathBuf::from),
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "on" | "yes" | "1")
}

/// Casting rules arrive as a JSON object, e.g. `{"number": "STRING"}`.
fn parse_casting(raw: &str, dialect: SqlDialect) -> Result<HashMap<String, RemoteType>> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let rules: HashMap<String, String> = serde_json::from_str(raw)
        .map_err(|e| FdwError::Config(format!("fdw_casting must be a JSON object: {}", e)))?;

    let mut casting = HashMap::new();
    for (column, target) in rules {
        match parse_cast_target(&target, dialect) {
            Some(remote) => {
                casting.insert(column, remote);
            }
            None => warn!(column = %column, target = %target, "Ignoring invalid cast target"),
        }
    }
    Ok(casting)
}

/// Time zone names end up inside generated SQL, so only IANA-style names
/// and fixed offsets are accepted.
fn validate_time_zone(tz: &str) -> Result<()> {
    let valid = tz
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+' | ':'));
    if valid {
        Ok(())
    } else {
        Err(FdwError::Config(format!("invalid time zone '{}'", tz)))
    }
}

fn default_api_endpoint() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_page_size() -> u32 {
    10_000
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_release_timeout_ms() -> u64 {
    5_000
}

fn default_refresh_margin_secs() -> u64 {
    60
}

fn default_token_lifetime_secs() -> u64 {
    3600
}

fn default_scope() -> String {
    "https://www.googleapis.com/auth/bigquery".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = FdwConfig::load(&Args::default()).unwrap();
        assert_eq!(config.query.timeout_secs, 300);
        assert_eq!(config.query.page_size, 10_000);
        assert_eq!(config.query.dialect, SqlDialect::Standard);
        assert_eq!(config.credentials.refresh_margin_secs, 60);
        assert!(config.bigquery.api_endpoint.starts_with("https://"));
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args {
            project: Some("my-project".into()),
            page_size: Some(7),
            ..Default::default()
        };
        let config = FdwConfig::load(&args).unwrap();
        assert_eq!(config.bigquery.project, "my-project");
        assert_eq!(config.query.page_size, 7);
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let mut config = FdwConfig::default();
        config.query.page_size = 0;
        assert!(matches!(config.validate(), Err(FdwError::Config(_))));
    }

    #[test]
    fn test_dialect_fallback() {
        assert_eq!(SqlDialect::parse_lossy("legacy"), SqlDialect::Legacy);
        assert_eq!(SqlDialect::parse_lossy("non_existent"), SqlDialect::Standard);
    }

    #[test]
    fn test_table_options() {
        let options: HashMap<String, String> = [
            ("fdw_sql_dialect", "standard"),
            ("fdw_group", "true"),
            ("fdw_verbose", "false"),
            ("fdw_casting", r#"{"number": "STRING", "other": "SOME_INVALID_TYPE"}"#),
            ("fdw_convert_tz", "US/Eastern"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let parsed = TableOptions::from_options(&options, &QueryConfig::default()).unwrap();
        assert!(parsed.group_by);
        assert!(!parsed.verbose);
        assert_eq!(parsed.casting.get("number"), Some(&RemoteType::String));
        assert!(!parsed.casting.contains_key("other"));
        assert_eq!(parsed.convert_tz.as_deref(), Some("US/Eastern"));
    }

    #[test]
    fn test_empty_casting_is_ignored() {
        let options: HashMap<String, String> =
            [("fdw_casting".to_string(), String::new())].into_iter().collect();
        let parsed = TableOptions::from_options(&options, &QueryConfig::default()).unwrap();
        assert!(parsed.casting.is_empty());
    }

    #[test]
    fn test_time_zone_injection_rejected() {
        let options: HashMap<String, String> =
            [("fdw_convert_tz".to_string(), "UTC\") OR (1=1".to_string())].into_iter().collect();
        assert!(TableOptions::from_options(&options, &QueryConfig::default()).is_err());
    }

    #[test]
    fn test_limit_policy() {
        assert_eq!(LimitPolicy::parse("TRIM").unwrap(), LimitPolicy::Trim);
        assert!(LimitPolicy::parse("nope").is_err());
    }
}
