use std::path::{Component, Path};

use crate::PackageError;

/// Checks that a package member name stays inside the package root.
///
/// Rejects empty names, absolute paths, `..` components and Windows
/// prefixes (`C:`, `\\server`).
pub fn validate_entry_name(name: &str) -> Result<(), PackageError> {
    if name.is_empty() {
        return Err(PackageError::InvalidName("empty name".into()));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(PackageError::InvalidName(format!("absolute member: {name}")));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(PackageError::InvalidName(format!(
                    "member escapes package root: {name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(PackageError::InvalidName(format!("absolute member: {name}")));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
