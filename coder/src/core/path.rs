//! Sandbox path resolution for step file paths.
//!
//! Every file a step touches is addressed by a path relative to the task's
//! working directory. Resolution is purely lexical: `..` components are folded
//! against the components seen so far and any path that would leave the
//! working directory is rejected.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("file path must not be empty")]
    Empty,
    #[error("file path '{0}' must be relative to the working directory")]
    Absolute(String),
    #[error("file path '{0}' escapes the working directory")]
    Escapes(String),
}

/// Normalize a workspace-relative path to `/`-separated form without `.` or `..`.
///
/// Backslashes are treated as separators so plans written on Windows resolve the
/// same way everywhere.
pub fn normalize_relative(raw: &str) -> Result<String, PathError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    let unified = trimmed.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(PathError::Absolute(raw.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathError::Escapes(raw.to_string()));
                }
            }
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(PathError::Escapes(raw.to_string())),
            },
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(raw.to_string()));
            }
        }
    }

    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Resolve `raw` against `workdir`, rejecting anything outside it.
pub fn resolve_in_workdir(workdir: &Path, raw: &str) -> Result<PathBuf, PathError> {
    let relative = normalize_relative(raw)?;
    Ok(workdir.join(relative))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
