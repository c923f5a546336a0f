//! Completeness checks and single-winner assembly of logical files.
//!
//! Runners never share in-process state: the only coordination is the
//! exclusive creation of a claim marker in the chunk store and the presence
//! of the destination file. This holds when chunk receipts for one file are
//! handled by different processes.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chunkmerge_store::ChunkStore;

use crate::config::AssemblyConfig;
use crate::merger::{FileMerger, MergeSummary};
use crate::naming::{LogicalFileId, claim_name};
use crate::resolver::{ChunkArtifact, ChunkSet, list_chunks};
use crate::AssemblyError;

/// How the caller knows how many chunks make up the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Declared total chunk count.
    Total(u64),
    /// Total unknown; this is the index of the final chunk.
    FinalChunk(u64),
}

impl Expected {
    /// Number of chunks for a file whose first index is `base`.
    pub fn total(self, base: u64) -> u64 {
        match self {
            Self::Total(n) => n,
            Self::FinalChunk(last) => last.saturating_sub(base).saturating_add(1),
        }
    }
}

/// A request to assemble one logical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRequest {
    pub logical_id: LogicalFileId,
    pub expected: Expected,
    /// Where the assembled file goes.
    pub destination: PathBuf,
}

/// A freshly assembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub path: PathBuf,
    pub size: u64,
    /// Hex SHA-256 of the assembled content.
    pub sha256: String,
    /// Artifacts merged, in merge order.
    pub chunks: Vec<String>,
    /// Artifacts that could not be deleted after the merge.
    pub cleanup_warnings: Vec<String>,
}

/// Result of [`AssemblyCoordinator::try_assemble`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// This call assembled the file.
    Assembled(AssembledFile),
    /// Some chunks are still missing. Nothing was touched.
    Incomplete {
        present: u64,
        expected: u64,
        /// First missing indices, bounded.
        missing: Vec<u64>,
    },
    /// Another runner assembled the file or is assembling it right now.
    AlreadyHandled { destination: PathBuf },
}

impl AssemblyOutcome {
    pub fn is_assembled(&self) -> bool {
        matches!(self, Self::Assembled(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }

    /// The assembled file, if this call produced it.
    pub fn assembled(&self) -> Option<&AssembledFile> {
        match self {
            Self::Assembled(file) => Some(file),
            _ => None,
        }
    }
}

/// Drives resolver, merger and cleanup for logical files in one store.
pub struct AssemblyCoordinator<S> {
    store: Arc<S>,
    config: AssemblyConfig,
}

impl<S> Clone for AssemblyCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: ChunkStore> AssemblyCoordinator<S> {
    pub fn new(store: Arc<S>, config: AssemblyConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Lists the current chunk set of `id`.
    pub fn list_chunks(&self, id: &LogicalFileId) -> Result<ChunkSet, AssemblyError> {
        list_chunks(&*self.store, id, &self.config.chunk_extension)
    }

    /// Assembles `request.logical_id` if its chunk set is complete.
    ///
    /// - No chunks at all: `AlreadyHandled` if the destination exists or a
    ///   claim is held, otherwise [`AssemblyError::MissingChunks`].
    /// - Some chunks missing: `Incomplete`, no side effects.
    /// - Complete: at most one concurrent caller wins the claim and merges;
    ///   the others get `AlreadyHandled`.
    ///
    /// On a failed merge the destination is left absent and every chunk
    /// artifact stays in place for a retry.
    pub fn try_assemble(&self, request: &AssemblyRequest) -> Result<AssemblyOutcome, AssemblyError> {
        let id = &request.logical_id;
        let base = self.config.numbering.base();
        let total = request.expected.total(base);

        let snapshot = self.list_chunks(id)?;
        if snapshot.is_empty() {
            return self.nothing_to_assemble(request);
        }
        if !snapshot.is_complete(base, total) {
            if self.claim_held(id)? {
                return Ok(self.handled_elsewhere(request));
            }
            tracing::debug!(
                logical_id = %id,
                present = snapshot.present_in(base, total),
                expected = total,
                "chunk set incomplete"
            );
            return Ok(incomplete(&snapshot, base, total));
        }

        let Some(claim) = self.claim(id)? else {
            tracing::debug!(logical_id = %id, "assembly claimed by another runner");
            return Ok(self.handled_elsewhere(request));
        };

        // The snapshot predates the claim; a previous winner may have
        // consumed the chunks in between.
        let chunks = self.list_chunks(id)?;
        if chunks.is_empty() {
            return Ok(self.handled_elsewhere(request));
        }
        if !chunks.is_complete(base, total) {
            return Ok(incomplete(&chunks, base, total));
        }

        match self.assemble(request, &claim, chunks, base, total) {
            Ok(assembled) => Ok(AssemblyOutcome::Assembled(assembled)),
            Err(AssemblyError::ClaimLost(_)) => {
                tracing::warn!(logical_id = %id, "assembly claim taken over, abandoning merge");
                Ok(self.handled_elsewhere(request))
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes every chunk artifact of `id`. Returns how many were removed.
    pub fn discard(&self, id: &LogicalFileId) -> Result<usize, AssemblyError> {
        let artifacts = self.list_chunks(id)?.into_all();
        let count = artifacts.len();
        for artifact in &artifacts {
            self.store.delete(&artifact.name)?;
        }
        if count > 0 {
            tracing::info!(logical_id = %id, chunks = count, "discarded chunk artifacts");
        }
        Ok(count)
    }

    /// Writes a file received in one piece straight to `destination`,
    /// with the same overwrite and no-partial-file guarantees as a merge.
    pub fn write_whole(
        &self,
        id: &LogicalFileId,
        data: &[u8],
        destination: &Path,
    ) -> Result<AssembledFile, AssemblyError> {
        let summary = self.publish(destination, |merger| merger.append_bytes(data), || Ok(()))?;
        tracing::info!(
            logical_id = %id,
            bytes = summary.bytes,
            destination = %destination.display(),
            "stored single-part upload"
        );
        Ok(AssembledFile {
            path: destination.to_path_buf(),
            size: summary.bytes,
            sha256: summary.sha256,
            chunks: Vec::new(),
            cleanup_warnings: Vec::new(),
        })
    }

    fn assemble(
        &self,
        request: &AssemblyRequest,
        claim: &ClaimGuard<'_, S>,
        chunks: ChunkSet,
        base: u64,
        total: u64,
    ) -> Result<AssembledFile, AssemblyError> {
        let id = &request.logical_id;
        chunks.report_duplicates(self.config.buffer_size);
        let (merge, leftovers) = chunks.into_merge_plan(base, total);

        // The claim is renewed after every chunk so a long merge never
        // looks abandoned, and checked once more before the rename.
        let summary = self.publish(
            &request.destination,
            |merger| {
                for artifact in &merge {
                    merger.append_file(&artifact.path)?;
                    claim.renew()?;
                }
                Ok(())
            },
            || claim.confirm(),
        )?;

        let cleanup_warnings = self.cleanup(id, merge.iter().chain(leftovers.iter()));

        tracing::info!(
            logical_id = %id,
            chunks = merge.len(),
            bytes = summary.bytes,
            destination = %request.destination.display(),
            "assembled file"
        );

        Ok(AssembledFile {
            path: request.destination.clone(),
            size: summary.bytes,
            sha256: summary.sha256,
            chunks: merge.into_iter().map(|a| a.name).collect(),
            cleanup_warnings,
        })
    }

    /// Replaces `destination` with whatever `fill` writes.
    ///
    /// Content goes to a hidden staging file next to the destination. Once
    /// it is closed and `confirm` agrees, the staging file is renamed over
    /// the destination, replacing any previous file in one step. Any
    /// failure removes the staging file and leaves the destination as it
    /// was, so it is never truncated.
    fn publish<F, C>(
        &self,
        destination: &Path,
        fill: F,
        confirm: C,
    ) -> Result<MergeSummary, AssemblyError>
    where
        F: FnOnce(&mut FileMerger) -> Result<(), AssemblyError>,
        C: FnOnce() -> Result<(), AssemblyError>,
    {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| AssemblyError::write(parent, e))?;
            }
        }

        let staging = staging_path(destination);
        let result = FileMerger::open(&staging, self.config.buffer_size)
            .and_then(|mut merger| {
                fill(&mut merger)?;
                merger.close()
            })
            .and_then(|summary| {
                confirm()?;
                fs::rename(&staging, destination)
                    .map_err(|e| AssemblyError::write(destination, e))?;
                Ok(summary)
            });

        match result {
            Ok(summary) => Ok(MergeSummary {
                destination: destination.to_path_buf(),
                ..summary
            }),
            Err(e) => {
                remove_staging(&staging);
                Err(e)
            }
        }
    }

    /// Deletes consumed artifacts in order. Failures are collected, not
    /// raised: the assembled file is already in place.
    fn cleanup<'a>(
        &self,
        id: &LogicalFileId,
        artifacts: impl Iterator<Item = &'a ChunkArtifact>,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        for artifact in artifacts {
            if let Err(e) = self.store.delete(&artifact.name) {
                tracing::warn!(
                    logical_id = %id,
                    chunk = %artifact.name,
                    error = %e,
                    "failed to delete consumed chunk"
                );
                warnings.push(format!("{}: {e}", artifact.name));
            }
        }
        warnings
    }

    fn nothing_to_assemble(&self, request: &AssemblyRequest) -> Result<AssemblyOutcome, AssemblyError> {
        if self.store.exists(&request.destination) || self.claim_held(&request.logical_id)? {
            return Ok(self.handled_elsewhere(request));
        }
        Err(AssemblyError::MissingChunks(request.logical_id.to_string()))
    }

    fn handled_elsewhere(&self, request: &AssemblyRequest) -> AssemblyOutcome {
        AssemblyOutcome::AlreadyHandled {
            destination: request.destination.clone(),
        }
    }

    /// Tries to become the single assembler of `id`.
    fn claim(&self, id: &LogicalFileId) -> Result<Option<ClaimGuard<'_, S>>, AssemblyError> {
        let name = claim_name(id);
        // Unique per attempt, so a runner can tell its claim from one that
        // replaced it.
        let marker = format!(
            "token={}\npid={}\n",
            uuid::Uuid::new_v4().simple(),
            std::process::id()
        );

        if self.store.create_exclusive(&name, marker.as_bytes())? {
            return Ok(Some(ClaimGuard::new(&*self.store, name, marker)));
        }

        if self.claim_is_stale(&name)? {
            tracing::warn!(logical_id = %id, "breaking stale assembly claim");
            self.store.delete(&name)?;
            if self.store.create_exclusive(&name, marker.as_bytes())? {
                return Ok(Some(ClaimGuard::new(&*self.store, name, marker)));
            }
        }

        Ok(None)
    }

    /// Returns `true` if a live (non-stale) claim exists for `id`.
    fn claim_held(&self, id: &LogicalFileId) -> Result<bool, AssemblyError> {
        let name = claim_name(id);
        if self.store.modified(&name)?.is_none() {
            return Ok(false);
        }
        Ok(!self.claim_is_stale(&name)?)
    }

    fn claim_is_stale(&self, name: &str) -> Result<bool, AssemblyError> {
        let Some(modified) = self.store.modified(name)? else {
            return Ok(false);
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        Ok(age >= self.config.stale_claim_after())
    }
}

impl<S: ChunkStore + 'static> AssemblyCoordinator<S> {
    /// Runs [`try_assemble`](Self::try_assemble) on the blocking pool.
    pub async fn try_assemble_async(
        &self,
        request: AssemblyRequest,
    ) -> Result<AssemblyOutcome, AssemblyError> {
        let coordinator = self.clone();
        tokio::task::spawn_blocking(move || coordinator.try_assemble(&request)).await?
    }
}

fn incomplete(set: &ChunkSet, base: u64, total: u64) -> AssemblyOutcome {
    AssemblyOutcome::Incomplete {
        present: set.present_in(base, total),
        expected: total,
        missing: set.missing(base, total),
    }
}

fn staging_path(destination: &Path) -> PathBuf {
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "assembled".into());
    let token = uuid::Uuid::new_v4().simple();
    destination.with_file_name(format!(".{file_name}.{token}.partial"))
}

fn remove_staging(staging: &Path) {
    if let Err(e) = fs::remove_file(staging) {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(file = %staging.display(), error = %e, "failed to remove staging file");
        }
    }
}

/// An assembly claim held by this runner. Released when dropped, unless
/// another runner has replaced it in the meantime.
struct ClaimGuard<'a, S: ChunkStore> {
    store: &'a S,
    name: String,
    marker: String,
}

impl<'a, S: ChunkStore> ClaimGuard<'a, S> {
    fn new(store: &'a S, name: String, marker: String) -> Self {
        Self {
            store,
            name,
            marker,
        }
    }

    /// Returns `true` while the marker in the store is still ours.
    fn is_held(&self) -> Result<bool, AssemblyError> {
        let current = self.store.read(&self.name)?;
        Ok(current.as_deref() == Some(self.marker.as_bytes()))
    }

    /// Fails with [`AssemblyError::ClaimLost`] if the claim was taken over.
    fn confirm(&self) -> Result<(), AssemblyError> {
        if self.is_held()? {
            Ok(())
        } else {
            Err(AssemblyError::ClaimLost(self.name.clone()))
        }
    }

    /// Confirms the claim and resets its age.
    fn renew(&self) -> Result<(), AssemblyError> {
        self.confirm()?;
        if !self.store.touch(&self.name)? {
            return Err(AssemblyError::ClaimLost(self.name.clone()));
        }
        Ok(())
    }
}

impl<S: ChunkStore> Drop for ClaimGuard<'_, S> {
    fn drop(&mut self) {
        match self.is_held() {
            Ok(true) => {
                if let Err(e) = self.store.delete(&self.name) {
                    tracing::warn!(claim = %self.name, error = %e, "failed to release assembly claim");
                }
            }
            Ok(false) => {
                tracing::debug!(claim = %self.name, "assembly claim replaced, leaving it");
            }
            Err(e) => {
                tracing::warn!(claim = %self.name, error = %e, "failed to check assembly claim");
            }
        }
    }
}
