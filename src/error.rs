//! Error types shared by every phase of a cutover.

use thiserror::Error;

/// Main error type for cutover operations.
#[derive(Error, Debug)]
pub enum CutoverError {
    /// User-fixable configuration problem (empty scope, failsafe tripped, bad config file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sampled data did not match between source and destination
    #[error("Data integrity failure on {table}: {message}")]
    DataIntegrity { table: String, message: String },

    /// External tool (pg_dump, psql, pg_restore) exited nonzero
    #[error("Command `{command}` failed with code {code:?}\n  err: {stderr}")]
    Subprocess {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Remote configuration could not be resolved
    #[error("Config resolver `{resolver}` failed: {message}")]
    Resolver { resolver: String, message: String },

    /// One or more connectivity probes failed
    #[error("Connectivity check failed for: {}", .0.join(", "))]
    Connectivity(Vec<String>),

    #[error("Postgres error: {0}")]
    Postgres(#[from] postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CutoverError {
    pub fn config(message: impl Into<String>) -> Self {
        CutoverError::Config(message.into())
    }

    pub fn integrity(table: impl Into<String>, message: impl Into<String>) -> Self {
        CutoverError::DataIntegrity {
            table: table.into(),
            message: message.into(),
        }
    }

    /// True for errors the operator must fix in configuration before retrying.
    pub fn is_config(&self) -> bool {
        matches!(self, CutoverError::Config(_) | CutoverError::Resolver { .. })
    }
}

/// Result type alias for cutover operations.
pub type Result<T> = std::result::Result<T, CutoverError>;
