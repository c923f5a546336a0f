//! Bounded-memory concatenation of chunk files into one destination.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::AssemblyError;

/// Default copy buffer: 64 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Destination of a merge that knows how to make its content durable.
pub trait Finalize: Write {
    /// Flushes buffered data; files also sync to disk.
    fn finalize(&mut self) -> std::io::Result<()> {
        self.flush()
    }
}

impl Finalize for File {
    fn finalize(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl Finalize for Vec<u8> {}

impl Finalize for std::io::Sink {}

/// Result of a closed merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub destination: PathBuf,
    pub bytes: u64,
    /// Hex SHA-256 of everything written.
    pub sha256: String,
    /// Number of sources appended.
    pub sources: usize,
}

/// Streams source files into one destination through a fixed buffer.
///
/// The destination is opened once for the whole sequence; no source is
/// ever loaded into memory in full.
pub struct FileMerger<W: Finalize = File> {
    writer: W,
    destination: PathBuf,
    buffer: Vec<u8>,
    hasher: Sha256,
    bytes: u64,
    sources: usize,
}

impl FileMerger<File> {
    /// Opens `destination` in create/append mode.
    ///
    /// A `buffer_size` of 0 selects [`DEFAULT_BUFFER_SIZE`].
    pub fn open(destination: &Path, buffer_size: usize) -> Result<Self, AssemblyError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .map_err(|e| AssemblyError::write(destination, e))?;
        Ok(Self::from_writer(destination, file, buffer_size))
    }
}

impl<W: Finalize> FileMerger<W> {
    /// Merges into an arbitrary writer; `destination` is only used in
    /// errors and the summary.
    pub fn from_writer(destination: impl Into<PathBuf>, writer: W, buffer_size: usize) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        Self {
            writer,
            destination: destination.into(),
            buffer: vec![0u8; buffer_size],
            hasher: Sha256::new(),
            bytes: 0,
            sources: 0,
        }
    }

    /// Appends the full content of `source`. Returns the bytes copied.
    pub fn append_file(&mut self, source: &Path) -> Result<u64, AssemblyError> {
        let mut file = File::open(source).map_err(|e| AssemblyError::read(source, e))?;
        let mut copied = 0u64;
        loop {
            let n = match file.read(&mut self.buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(AssemblyError::read(source, e)),
            };
            self.write_block(n)?;
            copied += n as u64;
        }
        self.sources += 1;
        Ok(copied)
    }

    /// Appends an in-memory block.
    pub fn append_bytes(&mut self, data: &[u8]) -> Result<(), AssemblyError> {
        self.writer
            .write_all(data)
            .map_err(|e| AssemblyError::write(&self.destination, e))?;
        self.hasher.update(data);
        self.bytes += data.len() as u64;
        self.sources += 1;
        Ok(())
    }

    fn write_block(&mut self, n: usize) -> Result<(), AssemblyError> {
        let block = &self.buffer[..n];
        self.writer
            .write_all(block)
            .map_err(|e| AssemblyError::write(&self.destination, e))?;
        self.hasher.update(block);
        self.bytes += n as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Flushes and syncs the destination.
    pub fn close(self) -> Result<MergeSummary, AssemblyError> {
        let (_, summary) = self.into_inner()?;
        Ok(summary)
    }

    /// Like [`close`](Self::close) but hands the writer back.
    pub fn into_inner(mut self) -> Result<(W, MergeSummary), AssemblyError> {
        self.writer
            .finalize()
            .map_err(|e| AssemblyError::write(&self.destination, e))?;
        let summary = MergeSummary {
            destination: self.destination,
            bytes: self.bytes,
            sha256: hex::encode(self.hasher.finalize()),
            sources: self.sources,
        };
        Ok((self.writer, summary))
    }
}

/// Hex SHA-256 of the file at `path`, streamed through the same bounded
/// buffer as a merge.
pub fn file_digest(path: &Path, buffer_size: usize) -> Result<String, AssemblyError> {
    let mut merger = FileMerger::from_writer(path, std::io::sink(), buffer_size);
    merger.append_file(path)?;
    Ok(merger.close()?.sha256)
}
