//! Directory-backed chunk store.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::{ChunkStore, StoreError, validate_blob_name};

/// Stores every blob as a regular file directly under `root`.
///
/// Writes go to a hidden temporary file first and are renamed into place,
/// so concurrent listings only ever see complete blobs.
#[derive(Debug, Clone)]
pub struct LocalChunkStore {
    root: PathBuf,
}

impl LocalChunkStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        let token = uuid::Uuid::new_v4().simple();
        self.root.join(format!(".{name}.{token}.tmp"))
    }
}

impl ChunkStore for LocalChunkStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_blob_name(name)?;
        let target = self.root.join(name);
        let temp = self.temp_path(name);

        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        })();

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp) {
                if cleanup.kind() != ErrorKind::NotFound {
                    tracing::warn!(file = %temp.display(), error = %cleanup, "failed to remove temporary blob");
                }
            }
            return Err(e.into());
        }

        tracing::trace!(name, bytes = bytes.len(), "stored blob");
        Ok(())
    }

    fn list(&self, predicate: &dyn Fn(&str) -> bool) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries.flatten() {
            // Entries can vanish between read_dir and file_type.
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if predicate(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_blob_name(name)?;
        Ok(self.root.join(name))
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        validate_blob_name(name)?;
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_exclusive(&self, name: &str, contents: &[u8]) -> Result<bool, StoreError> {
        validate_blob_name(name)?;
        Ok(create_new_with(&self.root.join(name), |file| file.write_all(contents))?)
    }

    fn modified(&self, name: &str) -> Result<Option<SystemTime>, StoreError> {
        validate_blob_name(name)?;
        match fs::metadata(self.root.join(name)) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_blob_name(name)?;
        match fs::read(self.root.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn touch(&self, name: &str) -> Result<bool, StoreError> {
        validate_blob_name(name)?;
        let file = match OpenOptions::new().write(true).open(self.root.join(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.set_modified(SystemTime::now())?;
        Ok(true)
    }
}

/// Creates `path` only if it does not exist and lets `fill` write it.
///
/// Returns `Ok(false)` if the file already existed. A file whose `fill`
/// fails is removed again, so a half-written marker never blocks others.
fn create_new_with(
    path: &Path,
    fill: impl FnOnce(&mut fs::File) -> std::io::Result<()>,
) -> std::io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    if let Err(e) = fill(&mut file) {
        drop(file);
        if let Err(cleanup) = fs::remove_file(path) {
            tracing::warn!(file = %path.display(), error = %cleanup, "failed to remove unfinished blob");
        }
        return Err(e);
    }
    Ok(true)
}
