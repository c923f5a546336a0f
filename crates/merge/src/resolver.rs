//! Discovery and ordering of the chunk artifacts of one logical file.

use std::ops::Range;
use std::path::PathBuf;
use std::time::SystemTime;

use chunkmerge_store::ChunkStore;

use crate::AssemblyError;
use crate::merger::file_digest;
use crate::naming::{ChunkPattern, LogicalFileId, natural_cmp};

/// Upper bound on the missing indices reported for an incomplete set.
pub const MISSING_REPORT_LIMIT: usize = 64;

/// A stored chunk blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkArtifact {
    /// Store name, e.g. `upload42.3.part`.
    pub name: String,
    pub index: u64,
    /// Absolute location for reading.
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Snapshot of the chunk artifacts present for one logical file.
///
/// `artifacts` holds at most one artifact per index, ascending. Artifacts
/// that lost a duplicate-index resolution are kept in `superseded` so they
/// can be cleaned up with the rest.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    logical_id: LogicalFileId,
    artifacts: Vec<ChunkArtifact>,
    superseded: Vec<ChunkArtifact>,
}

impl ChunkSet {
    pub fn logical_id(&self) -> &LogicalFileId {
        &self.logical_id
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Number of distinct chunk indices present.
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn artifacts(&self) -> &[ChunkArtifact] {
        &self.artifacts
    }

    pub fn superseded(&self) -> &[ChunkArtifact] {
        &self.superseded
    }

    pub fn indices(&self) -> Vec<u64> {
        self.artifacts.iter().map(|a| a.index).collect()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.artifacts
            .binary_search_by_key(&index, |a| a.index)
            .is_ok()
    }

    /// Number of distinct indices inside `base..base + total`.
    pub fn present_in(&self, base: u64, total: u64) -> u64 {
        let range = index_range(base, total);
        self.artifacts
            .iter()
            .filter(|a| range.contains(&a.index))
            .count() as u64
    }

    /// Returns `true` if every index of `base..base + total` is present.
    pub fn is_complete(&self, base: u64, total: u64) -> bool {
        total > 0 && self.present_in(base, total) == total
    }

    /// Missing indices of `base..base + total`, ascending, at most
    /// [`MISSING_REPORT_LIMIT`] of them.
    pub fn missing(&self, base: u64, total: u64) -> Vec<u64> {
        index_range(base, total)
            .filter(|i| !self.contains(*i))
            .take(MISSING_REPORT_LIMIT)
            .collect()
    }

    /// Logs every superseded duplicate, comparing its content with the
    /// artifact that won its index. Returns how many diverged.
    ///
    /// Reads both files in full, so callers run it once per assembly rather
    /// than on every listing.
    pub fn report_duplicates(&self, buffer_size: usize) -> usize {
        let mut divergent = 0;
        for loser in &self.superseded {
            let Ok(pos) = self.artifacts.binary_search_by_key(&loser.index, |a| a.index) else {
                continue;
            };
            let winner = &self.artifacts[pos];
            let differs = match (
                file_digest(&winner.path, buffer_size),
                file_digest(&loser.path, buffer_size),
            ) {
                (Ok(a), Ok(b)) => a != b,
                // Unreadable now; the merge will surface it if it matters.
                _ => true,
            };
            if differs {
                divergent += 1;
                tracing::warn!(
                    logical_id = %self.logical_id,
                    index = loser.index,
                    kept = %winner.name,
                    superseded = %loser.name,
                    "duplicate chunk index with divergent content, keeping most recent"
                );
            } else {
                tracing::debug!(
                    logical_id = %self.logical_id,
                    index = loser.index,
                    superseded = %loser.name,
                    "duplicate chunk index with identical content"
                );
            }
        }
        divergent
    }

    /// Splits the set into the artifacts to merge (every index of
    /// `base..base + total`, ascending) and everything else belonging to
    /// the logical file: superseded duplicates and out-of-range indices.
    pub fn into_merge_plan(self, base: u64, total: u64) -> (Vec<ChunkArtifact>, Vec<ChunkArtifact>) {
        let range = index_range(base, total);
        let (merge, mut leftovers): (Vec<_>, Vec<_>) = self
            .artifacts
            .into_iter()
            .partition(|a| range.contains(&a.index));
        leftovers.extend(self.superseded);
        (merge, leftovers)
    }

    /// Every artifact of the logical file, merge candidates first.
    pub fn into_all(self) -> Vec<ChunkArtifact> {
        let mut all = self.artifacts;
        all.extend(self.superseded);
        all
    }
}

fn index_range(base: u64, total: u64) -> Range<u64> {
    base..base.saturating_add(total)
}

/// Lists and orders every chunk artifact of `id` currently in `store`.
///
/// Indices sort numerically, so chunk 10 follows chunk 2. When two
/// artifacts carry the same index (e.g. `a.1.part` and `a.01.part`) the
/// most recently written one wins; equal timestamps fall back to the later
/// name in natural order. Returns an empty set when nothing matches. Never
/// locks: the result is a snapshot and may be stale by the time it is used.
pub fn list_chunks<S: ChunkStore + ?Sized>(
    store: &S,
    id: &LogicalFileId,
    extension: &str,
) -> Result<ChunkSet, AssemblyError> {
    let pattern = ChunkPattern::for_file(id, extension);
    let names = store.list(&|name: &str| pattern.matches(name))?;

    let mut found = Vec::with_capacity(names.len());
    for name in names {
        let Some(index) = pattern.parse_index(&name) else {
            continue;
        };
        // Consumed by a concurrent assembly since the listing.
        let Some(modified) = store.modified(&name)? else {
            continue;
        };
        let path = store.path(&name)?;
        found.push(ChunkArtifact {
            name,
            index,
            path,
            modified,
        });
    }

    found.sort_by(|a, b| {
        a.index
            .cmp(&b.index)
            .then_with(|| natural_cmp(&a.name, &b.name))
    });

    let mut artifacts: Vec<ChunkArtifact> = Vec::with_capacity(found.len());
    let mut superseded = Vec::new();
    for artifact in found {
        match artifacts.last_mut() {
            Some(current) if current.index == artifact.index => {
                if artifact.modified >= current.modified {
                    superseded.push(std::mem::replace(current, artifact));
                } else {
                    superseded.push(artifact);
                }
            }
            _ => artifacts.push(artifact),
        }
    }

    Ok(ChunkSet {
        logical_id: id.clone(),
        artifacts,
        superseded,
    })
}
