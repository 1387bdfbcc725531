//! Error types shared across the build pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can abort a build. Workers do not recover from any of these:
/// the first one raised sets the force-termination flag and the whole run
/// exits non-zero.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bin {bin} does not fit in memory, {shortfall} more bytes needed")]
    Memory { bin: String, shortfall: u64 },

    #[error("format error: {0}")]
    Format(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
