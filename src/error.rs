//! Error handling for the blackbird orchestrator
//!
//! Errors fall in two groups: configuration and import problems that abort a
//! run before anything is spawned, and job-level failures that are recorded
//! against a single job and never stop the scheduler.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for reconnaissance operations
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Unknown module or tag: {0}")]
    ModuleNotFound(String),

    #[error("No inventory to process: {0}")]
    NoInventory(String),

    #[error("Failed to import {}: {reason}", .path.display())]
    ImportError { path: PathBuf, reason: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("XML error: {0}")]
    XmlError(#[from] quick_xml::Error),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Module error: {0}")]
    ModuleError(String),

    #[error("Job killed by operator")]
    Killed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type alias for reconnaissance operations
pub type ReconResult<T> = Result<T, ReconError>;

impl ReconError {
    /// Errors that must stop the run before any job is scheduled.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconError::ConfigError(_)
                | ReconError::InvalidTarget(_)
                | ReconError::ModuleNotFound(_)
                | ReconError::NoInventory(_)
                | ReconError::ImportError { .. }
        )
    }

    pub fn import<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        ReconError::ImportError {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
