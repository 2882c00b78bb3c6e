/*!
 * Error types for Breakwater
 */

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BreakwaterError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum BreakwaterError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Config file could not be parsed
    #[error("Invalid config file {path}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Config could not be rendered as TOML
    #[error("Failed to serialize config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Report could not be rendered as JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Target named on the command line is not in the config
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// Pool construction or a pooled call failed
    #[error("Pool error: {0}")]
    Pool(String),

    /// Some simulated calls failed
    #[error("{failed} of {total} calls failed")]
    PartialFailure { failed: u64, total: u64 },
}

impl BreakwaterError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BreakwaterError::Config(_)
            | BreakwaterError::TomlParse { .. }
            | BreakwaterError::TomlSerialize(_)
            | BreakwaterError::UnknownTarget(_) => EXIT_FATAL,
            BreakwaterError::PartialFailure { .. } => EXIT_PARTIAL,
            BreakwaterError::Io(_) | BreakwaterError::Json(_) | BreakwaterError::Pool(_) => {
                EXIT_FATAL
            }
        }
    }
}

impl<E: std::fmt::Display> From<breakwater_core_resilience::PoolError<E>> for BreakwaterError {
    fn from(err: breakwater_core_resilience::PoolError<E>) -> Self {
        BreakwaterError::Pool(err.to_string())
    }
}
