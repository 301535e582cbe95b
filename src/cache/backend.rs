//! Storage Backend Module
//!
//! The entry store contract shared by every backend, and the in-memory map.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cache::CacheEntry;
use crate::error::Result;

// == Storage Backend ==
/// Uniform interface over an entry store.
///
/// Implementations may be remote or disk-backed, but must give read-after-write
/// consistency to a single cache instance. Keys are the cache's own keys; any
/// namespacing is the backend's business.
#[async_trait]
pub trait StorageBackend<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Fetches an entry, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<T>>>;

    /// Stores an entry, replacing any previous one. Either fully commits or fails.
    async fn set(&self, key: &str, entry: CacheEntry<T>) -> Result<()>;

    /// Removes an entry, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Removes every entry owned by this backend.
    async fn clear(&self) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    async fn entries(&self) -> Result<Vec<(String, CacheEntry<T>)>>;

    async fn size(&self) -> Result<usize>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

// == Memory Backend ==
/// Entries kept in a process-local hash map.
#[derive(Debug)]
pub struct MemoryBackend<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
}

impl<T> MemoryBackend<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> StorageBackend<T> for MemoryBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry<T>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn entries(&self) -> Result<Vec<(String, CacheEntry<T>)>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
