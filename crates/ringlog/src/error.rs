//! Engine-level error types.

use thiserror::Error;

/// Errors surfaced by the registry and log lifecycle operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Config text failed to parse.
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
    /// A log with this name already exists.
    #[error("log name already in use: {0}")]
    DuplicateName(String),
    /// No log with this name or id.
    #[error("unknown log: {0}")]
    UnknownLog(String),
    /// Creating the buffer group (or its backing file) failed.
    #[error("buffer setup failed: {0}")]
    Setup(#[from] ringlog_buffer::SetupError),
}
