//! File system access scoped to the task working directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::core::path::{PathError, normalize_relative};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Escape(#[from] PathError),
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Sandboxed file operations. Paths are workspace-relative.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Working directory every path is resolved against.
    fn root(&self) -> &Path;

    async fn read(&self, path: &str) -> Result<String, FsError>;

    /// Write atomically, creating parent directories as needed.
    async fn write(&self, path: &str, contents: &str) -> Result<(), FsError>;

    /// False for missing files and for paths outside the sandbox.
    async fn exists(&self, path: &str) -> bool;

    /// Files under `dir` (`""` for the root), optionally filtered by a glob.
    async fn list(&self, dir: &str, pattern: Option<&str>) -> Result<Vec<String>, FsError>;
}

/// [`FileSystem`] backed by the local disk under `root`.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf), FsError> {
        let relative = normalize_relative(path)?;
        let absolute = self.root.join(&relative);
        Ok((relative, absolute))
    }
}

fn io_error(op: &'static str, path: &str, source: std::io::Error) -> FsError {
    FsError::Io {
        op,
        path: path.to_string(),
        source,
    }
}

#[async_trait]
impl FileSystem for LocalFs {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, path: &str) -> Result<String, FsError> {
        let (relative, absolute) = self.resolve(path)?;
        match tokio::fs::read_to_string(&absolute).await {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(FsError::NotFound(relative)),
            Err(err) => Err(io_error("read", &relative, err)),
        }
    }

    async fn write(&self, path: &str, contents: &str) -> Result<(), FsError> {
        let (relative, absolute) = self.resolve(path)?;
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error("create directory for", &relative, err))?;
        }
        let file_name = absolute
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = absolute.with_file_name(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp_path, contents)
            .await
            .map_err(|err| io_error("write temp file for", &relative, err))?;
        tokio::fs::rename(&tmp_path, &absolute)
            .await
            .map_err(|err| io_error("replace", &relative, err))?;
        debug!(path = %relative, bytes = contents.len(), "wrote file");
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok((_, absolute)) => tokio::fs::try_exists(&absolute).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn list(&self, dir: &str, pattern: Option<&str>) -> Result<Vec<String>, FsError> {
        let trimmed = dir.trim();
        let base = if trimmed.is_empty() || trimmed == "." {
            self.root.clone()
        } else {
            self.resolve(trimmed)?.1
        };
        let matcher = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|err| {
                io_error(
                    "parse glob",
                    pattern.unwrap_or_default(),
                    std::io::Error::new(ErrorKind::InvalidInput, err),
                )
            })?;
        let root = self.root.clone();

        let listed = tokio::task::spawn_blocking(move || list_files(&root, &base, matcher.as_ref()))
            .await
            .map_err(|err| io_error("list", dir, std::io::Error::other(err)))?;
        listed.map_err(|err| io_error("list", dir, err))
    }
}

fn list_files(
    root: &Path,
    base: &Path,
    matcher: Option<&glob::Pattern>,
) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(base)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        let keep = match matcher {
            Some(pattern) if pattern.as_str().contains('/') => pattern.matches(&relative),
            Some(pattern) => pattern.matches(&entry.file_name().to_string_lossy()),
            None => true,
        };
        if keep {
            files.push(relative);
        }
    }
    Ok(files)
}
