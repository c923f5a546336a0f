//! Assembly configuration.
//!
//! Reads/writes camelCase JSON. Missing fields fall back to defaults and
//! out-of-range values are clamped, so a hand-edited file never stops
//! uploads from being assembled.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::merger::DEFAULT_BUFFER_SIZE;
use crate::naming::{CLAIM_EXTENSION, DEFAULT_CHUNK_EXTENSION};

const MIN_BUFFER_SIZE: usize = 4 * 1024;
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default age after which an assembly claim is considered abandoned.
pub const DEFAULT_STALE_CLAIM_SECS: u64 = 600;

/// Whether the first chunk of a file carries index 0 or 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChunkNumbering {
    #[default]
    ZeroBased,
    OneBased,
}

impl ChunkNumbering {
    /// Index of the first chunk.
    pub fn base(self) -> u64 {
        match self {
            Self::ZeroBased => 0,
            Self::OneBased => 1,
        }
    }
}

/// On-disk config format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_dir: Option<PathBuf>,
    #[serde(default)]
    chunk_extension: String,
    #[serde(default)]
    buffer_size: usize,
    #[serde(default)]
    max_chunk_size: u64,
    #[serde(default)]
    stale_claim_secs: u64,
    #[serde(default)]
    numbering: ChunkNumbering,
}

/// Settings shared by the store, coordinator and upload sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyConfig {
    /// Directory holding chunk artifacts.
    pub chunk_dir: PathBuf,
    /// Extension of chunk artifacts, without the dot.
    pub chunk_extension: String,
    /// Copy buffer used while merging.
    pub buffer_size: usize,
    /// Largest accepted chunk in bytes (0 = unlimited).
    pub max_chunk_size: u64,
    /// Age after which an assembly claim is broken.
    pub stale_claim_secs: u64,
    pub numbering: ChunkNumbering,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            chunk_dir: std::env::temp_dir().join("chunkmerge"),
            chunk_extension: DEFAULT_CHUNK_EXTENSION.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_chunk_size: 0,
            stale_claim_secs: DEFAULT_STALE_CLAIM_SECS,
            numbering: ChunkNumbering::ZeroBased,
        }
    }
}

impl AssemblyConfig {
    /// Defaults with chunks kept under `chunk_dir`.
    pub fn with_chunk_dir(chunk_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_dir: chunk_dir.into(),
            ..Default::default()
        }
    }

    /// Loads configuration from `path`.
    ///
    /// A missing file yields defaults. An unparsable file is logged and
    /// also yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if !path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<ConfigFile>(&content) {
            Ok(file) => config.apply(file),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse assembly config, using defaults"
                );
            }
        }

        Ok(config)
    }

    /// Saves configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = ConfigFile {
            chunk_dir: Some(self.chunk_dir.clone()),
            chunk_extension: self.chunk_extension.clone(),
            buffer_size: self.buffer_size,
            max_chunk_size: self.max_chunk_size,
            stale_claim_secs: self.stale_claim_secs,
            numbering: self.numbering,
        };

        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;

        tracing::debug!(path = %path.display(), "assembly configuration saved");
        Ok(())
    }

    /// Age after which an assembly claim is broken.
    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    fn apply(&mut self, file: ConfigFile) {
        if let Some(dir) = file.chunk_dir {
            if !dir.as_os_str().is_empty() {
                self.chunk_dir = dir;
            }
        }
        if is_valid_extension(&file.chunk_extension) {
            self.chunk_extension = file.chunk_extension;
        } else if !file.chunk_extension.is_empty() {
            tracing::warn!(
                extension = %file.chunk_extension,
                "ignoring invalid chunk extension"
            );
        }
        if file.buffer_size > 0 {
            self.buffer_size = file.buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        }
        self.max_chunk_size = file.max_chunk_size;
        if file.stale_claim_secs > 0 {
            self.stale_claim_secs = file.stale_claim_secs;
        }
        self.numbering = file.numbering;
    }
}

/// Extensions must be plain ASCII alphanumerics so a chunk name always
/// parses back unambiguously. The store's temporaries and claim markers
/// must never look like chunks.
fn is_valid_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        && !ext.eq_ignore_ascii_case("tmp")
        && !ext.eq_ignore_ascii_case(CLAIM_EXTENSION)
}
