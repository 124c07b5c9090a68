//! Error types for modelyard-core

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not in the GGUF container format (bad magic).
    #[error("invalid model format: {0}")]
    InvalidFormat(String),

    /// The GGUF version predates the oldest layout this reader understands.
    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    /// The file carried the right magic but became structurally invalid
    /// mid-stream. `offset` is the byte position where decoding failed.
    #[error("corrupt model file at byte {offset}: {reason}")]
    CorruptFile { offset: u64, reason: String },

    /// Every resolution tier was exhausted. `searched` lists the locations
    /// that were tried, in precedence order, so callers can show all of them.
    #[error("model '{id}' not found ({} locations searched)", .searched.len())]
    ModelNotFound { id: String, searched: Vec<PathBuf> },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("registry error: {0}")]
    RegistryError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}
