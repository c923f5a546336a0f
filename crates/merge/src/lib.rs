//! Reassembly of files uploaded as independent chunks.
//!
//! Chunks may arrive out of order, concurrently, or from several parallel
//! upload sessions. Each one is stored as `<logical id>.<index>.<ext>` in a
//! [`ChunkStore`](chunkmerge_store::ChunkStore); once the set is complete a
//! single runner streams the chunks, in index order, into the destination
//! and deletes them.

mod config;
mod coordinator;
mod error;
mod merger;
mod naming;
mod resolver;
mod session;

pub use config::{AssemblyConfig, ChunkNumbering, DEFAULT_STALE_CLAIM_SECS};
pub use coordinator::{
    AssembledFile, AssemblyCoordinator, AssemblyOutcome, AssemblyRequest, Expected,
};
pub use error::{AssemblyError, ConfigError};
pub use merger::{DEFAULT_BUFFER_SIZE, FileMerger, Finalize, MergeSummary, file_digest};
pub use naming::{
    ChunkPattern, DEFAULT_CHUNK_EXTENSION, LogicalFileId, chunk_artifact_name, claim_name,
    natural_cmp,
};
pub use resolver::{ChunkArtifact, ChunkSet, MISSING_REPORT_LIMIT, list_chunks};
pub use session::{ChunkReceipt, FinalNamer, ReceivedChunk, SaveStrategy, UploadSession};

pub use chunkmerge_store::{ChunkStore, LocalChunkStore, StoreError};
