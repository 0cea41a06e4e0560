// External crates
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A `FilePosition` that violates its construction invariants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PositionError {
    #[error("file position requires a non-empty file path")]
    EmptyFilePath,

    #[error("file position requires a non-empty project name")]
    EmptyProjectName,
}

/// Failures raised by a `PositionStore` backend.
///
/// Only writes surface these; reads of missing or corrupt entries degrade to
/// "no stored position" instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize file position: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid file position: {0}")]
    Position(#[from] PositionError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sqlite connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("a cached store cannot wrap another cached store")]
    NestedCache,
}

impl StoreError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
