//! Receipt of individual chunks and the save strategies that decide when a
//! logical file gets assembled.

use std::path::PathBuf;

use chunkmerge_store::ChunkStore;

use crate::coordinator::{AssemblyCoordinator, AssemblyOutcome, AssemblyRequest, Expected};
use crate::naming::{LogicalFileId, chunk_artifact_name};
use crate::AssemblyError;

/// One chunk as handed over by the request layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedChunk {
    pub logical_id: LogicalFileId,
    pub index: u64,
    /// Declared total chunk count, if the client sent one.
    pub total: Option<u64>,
    /// Set by the client on the last chunk when the total is unknown.
    pub is_last: bool,
    /// Whether the transport reported the upload as intact.
    pub transport_ok: bool,
    pub data: Vec<u8>,
}

impl ReceivedChunk {
    pub fn new(logical_id: LogicalFileId, index: u64, data: Vec<u8>) -> Self {
        Self {
            logical_id,
            index,
            total: None,
            is_last: false,
            transport_ok: true,
            data,
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn last(mut self) -> Self {
        self.is_last = true;
        self
    }

    /// Expectation this chunk carries about the full file, if any.
    fn expected(&self) -> Option<Expected> {
        match (self.total, self.is_last) {
            (Some(total), _) => Some(Expected::Total(total)),
            (None, true) => Some(Expected::FinalChunk(self.index)),
            (None, false) => None,
        }
    }

    fn is_final(&self, base: u64) -> bool {
        self.is_last || self.total.is_some_and(|t| self.index.saturating_add(1) == base.saturating_add(t))
    }
}

/// What happened to a received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// Store name of the chunk artifact, if one was written.
    pub artifact: Option<String>,
    /// Assembly result, if assembly was attempted for this chunk.
    pub outcome: Option<AssemblyOutcome>,
}

/// How the chunks of an upload are saved, selected once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStrategy {
    /// The whole file arrives as a single chunk.
    Single,
    /// Chunks arrive one after another; assemble on the final chunk.
    Chunked,
    /// Chunks arrive concurrently; try to assemble after every chunk.
    /// Requires a declared total.
    Parallel,
}

impl SaveStrategy {
    /// Persists the chunk. Returns the artifact name, if any.
    pub fn handle_chunk_file<S: ChunkStore>(
        self,
        coordinator: &AssemblyCoordinator<S>,
        chunk: &ReceivedChunk,
    ) -> Result<Option<String>, AssemblyError> {
        match self {
            Self::Single => Ok(None),
            Self::Chunked | Self::Parallel => {
                let name = chunk_artifact_name(
                    &chunk.logical_id,
                    chunk.index,
                    &coordinator.config().chunk_extension,
                );
                coordinator.store().put(&name, &chunk.data)?;
                tracing::debug!(
                    logical_id = %chunk.logical_id,
                    index = chunk.index,
                    bytes = chunk.data.len(),
                    "stored chunk"
                );
                Ok(Some(name))
            }
        }
    }

    /// Builds the full file when this strategy says it is time.
    pub fn build_full_file<S: ChunkStore>(
        self,
        coordinator: &AssemblyCoordinator<S>,
        chunk: &ReceivedChunk,
        destination: PathBuf,
    ) -> Result<Option<AssemblyOutcome>, AssemblyError> {
        let base = coordinator.config().numbering.base();
        match self {
            Self::Single => {
                let file = coordinator.write_whole(&chunk.logical_id, &chunk.data, &destination)?;
                Ok(Some(AssemblyOutcome::Assembled(file)))
            }
            Self::Chunked if !chunk.is_final(base) => Ok(None),
            Self::Chunked | Self::Parallel => {
                let Some(expected) = chunk.expected() else {
                    return Ok(None);
                };
                let request = AssemblyRequest {
                    logical_id: chunk.logical_id.clone(),
                    expected,
                    destination,
                };
                coordinator.try_assemble(&request).map(Some)
            }
        }
    }
}

/// Produces the destination path of an assembled file.
pub type FinalNamer = Box<dyn Fn(&LogicalFileId) -> PathBuf + Send + Sync>;

/// Receives the chunks of uploads that share one strategy and store.
pub struct UploadSession<S> {
    coordinator: AssemblyCoordinator<S>,
    strategy: SaveStrategy,
    final_name: FinalNamer,
}

impl<S: ChunkStore> UploadSession<S> {
    pub fn new(
        coordinator: AssemblyCoordinator<S>,
        strategy: SaveStrategy,
        final_name: FinalNamer,
    ) -> Self {
        Self {
            coordinator,
            strategy,
            final_name,
        }
    }

    pub fn strategy(&self) -> SaveStrategy {
        self.strategy
    }

    pub fn coordinator(&self) -> &AssemblyCoordinator<S> {
        &self.coordinator
    }

    /// Destination of the assembled file for `id`.
    pub fn destination(&self, id: &LogicalFileId) -> PathBuf {
        (self.final_name)(id)
    }

    /// Validates and stores one chunk, then assembles if the strategy
    /// calls for it.
    ///
    /// An invalid chunk is rejected with [`AssemblyError::InvalidChunk`]
    /// before anything is written.
    pub fn receive(&self, chunk: ReceivedChunk) -> Result<ChunkReceipt, AssemblyError> {
        self.validate(&chunk)?;

        let artifact = self.strategy.handle_chunk_file(&self.coordinator, &chunk)?;
        let destination = self.destination(&chunk.logical_id);
        let outcome = self
            .strategy
            .build_full_file(&self.coordinator, &chunk, destination)?;

        Ok(ChunkReceipt { artifact, outcome })
    }

    fn validate(&self, chunk: &ReceivedChunk) -> Result<(), AssemblyError> {
        let config = self.coordinator.config();
        let base = config.numbering.base();

        if !chunk.transport_ok {
            return Err(invalid(chunk, "upload reported invalid by transport"));
        }
        if chunk.data.is_empty() {
            return Err(invalid(chunk, "empty chunk"));
        }
        if config.max_chunk_size > 0 && chunk.data.len() as u64 > config.max_chunk_size {
            return Err(invalid(
                chunk,
                &format!(
                    "{} bytes exceeds limit of {}",
                    chunk.data.len(),
                    config.max_chunk_size
                ),
            ));
        }
        if chunk.index < base {
            return Err(invalid(chunk, &format!("index below first index {base}")));
        }
        if let Some(total) = chunk.total {
            if total == 0 {
                return Err(invalid(chunk, "declared total of zero chunks"));
            }
            if chunk.index >= base.saturating_add(total) {
                return Err(invalid(chunk, &format!("index outside declared total {total}")));
            }
        }

        match self.strategy {
            SaveStrategy::Single if chunk.index != base || chunk.total.is_some_and(|t| t != 1) => {
                Err(invalid(chunk, "single uploads carry exactly one chunk"))
            }
            SaveStrategy::Parallel if chunk.total.is_none() => Err(invalid(
                chunk,
                "parallel uploads must declare the total chunk count",
            )),
            _ => Ok(()),
        }
    }
}

fn invalid(chunk: &ReceivedChunk, reason: &str) -> AssemblyError {
    tracing::warn!(
        logical_id = %chunk.logical_id,
        index = chunk.index,
        reason,
        "rejected chunk"
    );
    AssemblyError::InvalidChunk(format!("{} chunk {}: {reason}", chunk.logical_id, chunk.index))
}
