//! Error types for the model depot

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised below the orchestrator
#[derive(Debug, Error)]
pub enum DepotError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O failure while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Compile failure: {0}")]
    Compile(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Artifact already installed at {}", .0.display())]
    AlreadyInstalled(PathBuf),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl DepotError {
    /// Wrap an I/O error with a short description of the operation
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for DepotError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<zip::result::ZipError> for DepotError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

pub type DepotResult<T> = Result<T, DepotError>;
