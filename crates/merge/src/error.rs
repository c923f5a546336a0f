//! Assembly error types.

use std::path::PathBuf;

use chunkmerge_store::StoreError;

/// Errors produced while storing chunks or assembling a logical file.
///
/// An incomplete chunk set is not an error; see
/// [`AssemblyOutcome::Incomplete`](crate::AssemblyOutcome::Incomplete).
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("no chunks found for {0}")]
    MissingChunks(String),

    #[error("failed to read chunk {path}: {source}")]
    ChunkRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    ChunkWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("invalid logical file id: {0}")]
    InvalidLogicalId(String),

    /// Another runner broke and replaced the assembly claim mid-merge.
    /// [`AssemblyCoordinator::try_assemble`](crate::AssemblyCoordinator::try_assemble)
    /// reports this as `AlreadyHandled`.
    #[error("assembly claim {0} was taken over by another runner")]
    ClaimLost(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AssemblyError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ChunkRead {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ChunkWrite {
            path: path.into(),
            source,
        }
    }
}

/// Errors produced while loading an [`AssemblyConfig`](crate::AssemblyConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
