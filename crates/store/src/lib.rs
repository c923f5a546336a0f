//! Chunk artifact storage.
//!
//! The assembly engine only talks to storage through the [`ChunkStore`]
//! trait. [`LocalChunkStore`] keeps every artifact as a flat file inside one
//! directory.

mod local;
mod validation;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub use local::LocalChunkStore;
pub use validation::validate_blob_name;

/// Errors produced by chunk stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob name: {0}")]
    InvalidName(String),
}

/// Persistence for chunk artifacts.
///
/// Names are flat (no directory components). Implementations must make
/// `put` atomic with respect to `list`: a listing never returns a blob
/// whose content is still being written.
pub trait ChunkStore: Send + Sync {
    /// Stores `bytes` under `name`, replacing any existing blob.
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Returns the names of all blobs accepted by `predicate`, in no
    /// particular order.
    fn list(&self, predicate: &dyn Fn(&str) -> bool) -> Result<Vec<String>, StoreError>;

    /// Returns the absolute location of `name` for direct read access.
    fn path(&self, name: &str) -> Result<PathBuf, StoreError>;

    /// Deletes `name`. Deleting a blob that is already gone succeeds.
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Returns `true` if something exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Creates `name` with `contents` only if it does not exist yet.
    ///
    /// Returns `Ok(false)` when another writer created it first.
    fn create_exclusive(&self, name: &str, contents: &[u8]) -> Result<bool, StoreError>;

    /// Returns the last modification time of `name`, or `None` if it is gone.
    fn modified(&self, name: &str) -> Result<Option<SystemTime>, StoreError>;

    /// Reads the full content of `name`, or `None` if it is gone.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Sets the modification time of `name` to now. Returns `Ok(false)` if
    /// it is gone.
    fn touch(&self, name: &str) -> Result<bool, StoreError>;
}

impl<T: ChunkStore + ?Sized> ChunkStore for std::sync::Arc<T> {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).put(name, bytes)
    }

    fn list(&self, predicate: &dyn Fn(&str) -> bool) -> Result<Vec<String>, StoreError> {
        (**self).list(predicate)
    }

    fn path(&self, name: &str) -> Result<PathBuf, StoreError> {
        (**self).path(name)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        (**self).delete(name)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }

    fn create_exclusive(&self, name: &str, contents: &[u8]) -> Result<bool, StoreError> {
        (**self).create_exclusive(name, contents)
    }

    fn modified(&self, name: &str) -> Result<Option<SystemTime>, StoreError> {
        (**self).modified(name)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).read(name)
    }

    fn touch(&self, name: &str) -> Result<bool, StoreError> {
        (**self).touch(name)
    }
}
