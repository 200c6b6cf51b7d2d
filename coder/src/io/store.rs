//! Key/value context store for JSON blobs with optional TTL.
//!
//! Keys are `:`-separated and namespaced by purpose (`execution:<task_id>`,
//! `depgraph:<project>`, ...). `scan` takes a glob over keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store entry {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid key pattern '{0}'")]
    Pattern(String),
}

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn put(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// `None` for missing or expired keys.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Live keys matching a glob such as `execution:*`, sorted.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

fn compile_pattern(pattern: &str) -> Result<glob::Pattern, StoreError> {
    glob::Pattern::new(pattern).map_err(|err| StoreError::Pattern(format!("{pattern}: {err}")))
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2))
}

fn is_expired(expires_at: Option<i64>) -> bool {
    expires_at.is_some_and(|at| Utc::now().timestamp() >= at)
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    value: Value,
}

/// One JSON file per key under a directory. File names are the hex-encoded key.
#[derive(Debug)]
pub struct FileContextStore {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key.as_bytes())))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<StoredEntry>, StoreError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    op: "read",
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let entry: StoredEntry = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        if is_expired(entry.expires_at) {
            debug!(key = %entry.key, "dropping expired store entry");
            let _ = tokio::fs::remove_file(path).await;
            return Ok(None);
        }
        Ok(Some(entry))
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn put(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let io = |op: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { op, path, source }
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io("create directory", &self.dir))?;

        let entry = StoredEntry {
            key: key.to_string(),
            expires_at: expiry(ttl),
            value: value.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&entry).map_err(|source| StoreError::Corrupt {
            path: self.entry_path(key),
            source,
        })?;
        buf.push('\n');

        let path = self.entry_path(key);
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("json.{n}.tmp"));
        tokio::fs::write(&tmp_path, buf)
            .await
            .map_err(io("write temp entry", &tmp_path))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(io("replace entry", &path))?;
        debug!(key, "stored entry");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .read_entry(&self.entry_path(key))
            .await?
            .map(|entry| entry.value))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let matcher = compile_pattern(pattern)?;
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    op: "read directory",
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut keys = Vec::new();
        loop {
            let next = dir.next_entry().await.map_err(|source| StoreError::Io {
                op: "read directory",
                path: self.dir.clone(),
                source,
            })?;
            let Some(file) = next else {
                break;
            };
            let name = file.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Some(key) = hex::decode(stem).ok().and_then(|raw| String::from_utf8(raw).ok())
            else {
                continue;
            };
            if !matcher.matches(&key) {
                continue;
            }
            if self.read_entry(&file.path()).await?.is_some() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                op: "remove",
                path,
                source,
            }),
        }
    }
}

/// In-process store, used when nothing should touch disk and in tests.
#[derive(Debug, Default)]
pub struct MemoryContextStore {
    entries: Mutex<HashMap<String, (Value, Option<i64>)>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Value, Option<i64>)>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn put(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.lock()
            .insert(key.to_string(), (value.clone(), expiry(ttl)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some((_, expires_at)) if is_expired(*expires_at) => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let matcher = compile_pattern(pattern)?;
        let mut entries = self.lock();
        entries.retain(|_, (_, expires_at)| !is_expired(*expires_at));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn file_store_round_trips_and_scans() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileContextStore::new(temp.path().join("store"));
        assert!(store.scan("execution:*").await.expect("scan empty").is_empty());

        store
            .put("execution:b", &json!({"n": 2}), None)
            .await
            .expect("put");
        store
            .put("execution:a", &json!({"n": 1}), None)
            .await
            .expect("put");
        store
            .put("history:a:0", &json!({}), None)
            .await
            .expect("put");

        assert_eq!(
            store.get("execution:a").await.expect("get"),
            Some(json!({"n": 1}))
        );
        assert_eq!(store.get("execution:zzz").await.expect("get"), None);
        assert_eq!(
            store.scan("execution:*").await.expect("scan"),
            vec!["execution:a", "execution:b"]
        );

        store.delete("execution:a").await.expect("delete");
        assert_eq!(store.get("execution:a").await.expect("get"), None);
    }

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = FileContextStore::new(temp.path());
        let memory = MemoryContextStore::new();
        for store in [&file as &dyn ContextStore, &memory as &dyn ContextStore] {
            store
                .put("k", &json!(1), Some(Duration::ZERO))
                .await
                .expect("put");
            store
                .put("live", &json!(2), Some(Duration::from_secs(3600)))
                .await
                .expect("put");
            assert_eq!(store.get("k").await.expect("get"), None);
            assert_eq!(store.scan("*").await.expect("scan"), vec!["live"]);
        }
    }

    #[tokio::test]
    async fn corrupt_entries_are_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileContextStore::new(temp.path());
        std::fs::write(temp.path().join(format!("{}.json", hex::encode("bad"))), "{")
            .expect("write");
        assert!(matches!(
            store.get("bad").await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
