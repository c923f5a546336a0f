use std::path::{Component, Path};

use crate::StoreError;

/// Validates that a blob name is a single plain file name.
///
/// Rejects:
/// - Empty names
/// - Names containing a path separator or NUL
/// - `.` and `..`
/// - Anything that would not resolve to exactly one normal path component
pub fn validate_blob_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidName("empty name".into()));
    }

    if name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidName(format!(
            "separator not allowed: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) | (Some(Component::CurDir), _) => Err(
            StoreError::InvalidName(format!("relative reference not allowed: {name}")),
        ),
        _ => Err(StoreError::InvalidName(format!(
            "not a plain file name: {name}"
        ))),
    }
}
