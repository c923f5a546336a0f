//! Chunk identity: logical file ids, artifact names and the parser that
//! maps artifact names back to chunk indices.

use std::cmp::Ordering;
use std::fmt;

use crate::AssemblyError;

/// Default chunk artifact extension.
pub const DEFAULT_CHUNK_EXTENSION: &str = "part";

/// Extension of assembly claim markers; never valid for chunks.
pub(crate) const CLAIM_EXTENSION: &str = "assembling";

/// Identifies the final file a set of chunks reconstructs.
///
/// Any characters except path separators and NUL are allowed, including
/// dots. A leading dot is rejected so ids never collide with the store's
/// hidden temporary files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalFileId(String);

impl LogicalFileId {
    pub fn new(id: impl Into<String>) -> Result<Self, AssemblyError> {
        let id = id.into();
        if id.is_empty() {
            return Err(AssemblyError::InvalidLogicalId("empty id".into()));
        }
        if id.starts_with('.') {
            return Err(AssemblyError::InvalidLogicalId(format!(
                "leading dot not allowed: {id}"
            )));
        }
        if id.contains(['/', '\\', '\0']) {
            return Err(AssemblyError::InvalidLogicalId(format!(
                "separator not allowed: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Builds an id from client metadata: the original file name plus a
    /// token unique to the upload.
    ///
    /// Characters outside `[A-Za-z0-9._-]` in the file name become `_`.
    pub fn derive(original_name: &str, session_token: &str) -> Result<Self, AssemblyError> {
        if session_token.is_empty() {
            return Err(AssemblyError::InvalidLogicalId("empty session token".into()));
        }
        let sanitized: String = original_name
            .trim_start_matches('.')
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = if sanitized.is_empty() {
            "upload".to_string()
        } else {
            sanitized
        };
        Self::new(format!("{name}-{session_token}"))
    }

    /// Like [`derive`](Self::derive) with a random token.
    pub fn generate(original_name: &str) -> Result<Self, AssemblyError> {
        Self::derive(original_name, &uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LogicalFileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Name of the artifact holding chunk `index` of `id`.
pub fn chunk_artifact_name(id: &LogicalFileId, index: u64, extension: &str) -> String {
    format!("{id}.{index}.{extension}")
}

/// Name of the marker whose exclusive creation grants the right to
/// assemble `id`.
pub fn claim_name(id: &LogicalFileId) -> String {
    format!("{id}.{CLAIM_EXTENSION}")
}

/// Recognizes the chunk artifacts of exactly one logical file.
///
/// A name matches when it is `<id>.<digits>.<extension>`. Prefix and suffix
/// are both anchored on the `.` delimiter and the middle must be digits
/// only, so `a.1.0.part` (chunk 0 of `a.1`) never matches the pattern of `a`.
#[derive(Debug, Clone)]
pub struct ChunkPattern {
    prefix: String,
    suffix: String,
}

impl ChunkPattern {
    pub fn for_file(id: &LogicalFileId, extension: &str) -> Self {
        Self {
            prefix: format!("{id}."),
            suffix: format!(".{extension}"),
        }
    }

    /// Returns the chunk index encoded in `name`, or `None` if `name` does
    /// not belong to this logical file.
    pub fn parse_index(&self, name: &str) -> Option<u64> {
        let rest = name.strip_prefix(&self.prefix)?;
        let digits = rest.strip_suffix(&self.suffix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.parse_index(name).is_some()
    }
}

/// Case-insensitive natural ordering: runs of digits compare by numeric
/// value, everything else by lowercase character.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ln = take_digits(&mut left);
                let rn = take_digits(&mut right);
                let ord = compare_digit_runs(&ln, &rn);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                let ord = l.to_lowercase().cmp(r.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
