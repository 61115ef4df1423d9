//! Error types for the BigQuery foreign data wrapper core.
//!
//! Every variant aborts the current scan and is surfaced to the host as a
//! failed statement. Only transient remote states are retried, and that
//! happens inside the query executor before an error ever reaches here.

use std::result;
use thiserror::Error;

/// A specialized Result type for wrapper operations.
pub type Result<T> = result::Result<T, FdwError>;

/// The error type for wrapper operations.
#[derive(Error, Debug)]
pub enum FdwError {
    /// Credential acquisition or refresh failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Remote table missing or metadata mismatch
    #[error("Schema error: {0}")]
    Schema(String),

    /// Internal contract violation while building the remote query
    #[error("Translation error: {0}")]
    Translation(String),

    /// The remote job or API call failed
    #[error("Remote query error [{code}]: {message}")]
    RemoteQuery { code: String, message: String },

    /// Polling exceeded the configured deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A remote value could not be converted to its declared host type
    #[error("Coercion error in column {column}: {message}")]
    Coercion { column: String, message: String },

    /// Invalid configuration or table options
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-level HTTP failures
    #[error("HTTP error: {0}")]
    Http(String),

    /// Arrow-related errors
    #[error("Arrow error: {0}")]
    Arrow(String),
}

/// Remote error reasons that are worth retrying with backoff.
const TRANSIENT_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "backendError",
    "internalError",
    "jobRateLimitExceeded",
    "429",
    "500",
    "502",
    "503",
];

/// Remote reasons meaning the access token itself was rejected.
const AUTH_REJECTIONS: &[&str] = &["authError", "401", "unauthorized"];

impl FdwError {
    /// Create a schema error
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        FdwError::Schema(msg.into())
    }

    /// Create a translation error
    pub fn translation<S: Into<String>>(msg: S) -> Self {
        FdwError::Translation(msg.into())
    }

    /// Create a remote query error
    pub fn remote<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        FdwError::RemoteQuery {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a coercion error
    pub fn coercion<C: Into<String>, M: Into<String>>(column: C, message: M) -> Self {
        FdwError::Coercion {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Whether the executor may retry the failed remote call.
    pub fn is_transient(&self) -> bool {
        match self {
            FdwError::RemoteQuery { code, .. } => TRANSIENT_REASONS.contains(&code.as_str()),
            FdwError::Http(_) => true,
            _ => false,
        }
    }

    /// Whether the warehouse refused the credential sent with the call.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, FdwError::RemoteQuery { code, .. } if AUTH_REJECTIONS.contains(&code.as_str()))
    }

    /// Short stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            FdwError::Auth(_) => "auth",
            FdwError::Schema(_) => "schema",
            FdwError::Translation(_) => "translation",
            FdwError::RemoteQuery { .. } => "remote_query",
            FdwError::Timeout(_) => "timeout",
            FdwError::Coercion { .. } => "coercion",
            FdwError::Config(_) => "config",
            FdwError::Io(_) => "io",
            FdwError::Serialization(_) => "serialization",
            FdwError::Http(_) => "http",
            FdwError::Arrow(_) => "arrow",
        }
    }
}

impl From<config::ConfigError> for FdwError {
    fn from(err: config::ConfigError) -> Self {
        FdwError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for FdwError {
    fn from(err: reqwest::Error) -> Self {
        FdwError::Http(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for FdwError {
    fn from(err: arrow::error::ArrowError) -> Self {
        FdwError::Arrow(err.to_string())
    }
}
