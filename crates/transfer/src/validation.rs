use std::path::{Component, Path};

use crate::TransferError;

/// Validates that `name` is a bare file name safe to join onto a directory.
///
/// The receiver uses client-supplied names for session directories and the
/// merged artifact, so anything other than a single normal path component
/// is rejected: empty names, separators, `.`/`..`, absolute paths and
/// Windows prefixes.
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidFileName("empty name".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(TransferError::InvalidFileName(format!(
            "path separators not allowed: {name}"
        )));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidFileName("NUL byte in name".into()));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir | Component::CurDir), _) => Err(
            TransferError::InvalidFileName(format!("relative directory not allowed: {name}")),
        ),
        _ => Err(TransferError::InvalidFileName(format!(
            "not a plain file name: {name}"
        ))),
    }
}
