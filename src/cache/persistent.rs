//! Persistent Backend Module
//!
//! A file-backed key-value store. The file holds a JSON object whose keys are
//! `"{namespace}:{key}"` and whose values are records of the form
//! `{ "key": ..., "entry": <CacheEntry>, "namespace": ... }`. Several caches may
//! share one file as long as their namespaces differ.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, StorageBackend};
use crate::error::{CacheError, Result};

/// On-disk record for one cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord<T> {
    pub key: String,
    pub entry: CacheEntry<T>,
    pub namespace: String,
}

type RecordMap = BTreeMap<String, Value>;

type FileLock = Arc<Mutex<()>>;

/// Returns the process-wide lock guarding `path`.
///
/// Every backend opened on the same file gets the same lock, so the
/// read-modify-write cycles of different namespaces never interleave.
fn file_lock(path: &Path) -> FileLock {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<PathBuf, FileLock>>> = OnceLock::new();

    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    locks.entry(lock_key(path)).or_default().clone()
}

/// Resolves `path` to one canonical spelling. The file itself may not exist
/// yet, so only its directory is canonicalized.
fn lock_key(path: &Path) -> PathBuf {
    if let Ok(full) = path.canonicalize() {
        return full;
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}

// == Persistent Backend ==
/// Entries stored in a JSON file, one record per key.
///
/// Every operation reads the file, and every mutation rewrites it through a
/// uniquely named temporary file followed by a rename, so a write is never
/// half applied.
#[derive(Debug)]
pub struct PersistentBackend<T> {
    path: PathBuf,
    namespace: String,
    /// Shared by all backends on this file
    lock: FileLock,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PersistentBackend<T> {
    pub fn new(path: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            lock: file_lock(&path),
            path,
            namespace: namespace.into(),
            _marker: PhantomData,
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    async fn load(&self) -> Result<RecordMap> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(RecordMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| CacheError::Serialization {
                key: self.path.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RecordMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, records: &RecordMap) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Internal(format!("cache file writer failed: {}", e)))??;

        debug!(path = %self.path.display(), records = records.len(), "persisted cache file");
        Ok(())
    }
}

impl<T: DeserializeOwned> PersistentBackend<T> {
    fn decode(&self, key: &str, raw: Value) -> Result<CacheEntry<T>> {
        serde_json::from_value::<PersistedRecord<T>>(raw)
            .map(|record| record.entry)
            .map_err(|e| CacheError::Serialization {
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl<T> StorageBackend<T> for PersistentBackend<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        match records.remove(&self.storage_key(key)) {
            Some(raw) => self.decode(key, raw).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry<T>) -> Result<()> {
        let record = PersistedRecord {
            key: key.to_string(),
            entry,
            namespace: self.namespace.clone(),
        };
        let raw = serde_json::to_value(&record).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        records.insert(self.storage_key(key), raw);
        self.store(&records).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        if records.remove(&self.storage_key(key)).is_none() {
            return Ok(false);
        }
        self.store(&records).await?;
        Ok(true)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.contains_key(&self.storage_key(key)))
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let prefix = self.prefix();
        let before = records.len();
        records.retain(|k, _| !k.starts_with(&prefix));
        if records.len() != before {
            self.store(&records).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let prefix = self.prefix();
        Ok(self
            .load()
            .await?
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn entries(&self) -> Result<Vec<(String, CacheEntry<T>)>> {
        let _guard = self.lock.lock().await;
        let prefix = self.prefix();
        let mut out = Vec::new();
        for (storage_key, raw) in self.load().await? {
            let Some(key) = storage_key.strip_prefix(&prefix) else {
                continue;
            };
            match self.decode(key, raw) {
                Ok(entry) => out.push((key.to_string(), entry)),
                Err(e) => warn!(key, error = %e, "skipping undecodable cache record"),
            }
        }
        Ok(out)
    }

    async fn size(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let prefix = self.prefix();
        Ok(self
            .load()
            .await?
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count())
    }

    fn name(&self) -> &'static str {
        "persistent"
    }
}
