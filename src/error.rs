//! Error types for scriptkeeper.
//!
//! Nothing in this crate is allowed to take the host down. Parse failures
//! fall back to the next registry format, persistence failures are retried on
//! the next save, fetch failures leave the cached blocklist in charge, and
//! execution failures stay contained to the script that raised them.

use std::path::PathBuf;

use thiserror::Error;

pub use crate::fetch::FetchError;
pub use crate::pattern::PatternError;

/// Errors that can occur in scriptkeeper.
#[derive(Debug, Error)]
pub enum KeeperError {
    /// Malformed script source or persisted registry file.
    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    /// Malformed include/exclude/match pattern.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Writing registry state to disk failed.
    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Network failure (blocklist refresh, install request).
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Uncaught failure inside an injected script.
    #[error("Script '{script}' failed: {message}")]
    Execution { script: String, message: String },

    #[error("Script '{0}' not found")]
    ScriptNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl KeeperError {
    pub(crate) fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for scriptkeeper operations.
pub type KeeperResult<T> = Result<T, KeeperError>;
