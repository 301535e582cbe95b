//! Cache Options Module
//!
//! Per-cache configuration, fixed once the cache is constructed.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::entry::Priority;
use crate::error::{CacheError, Result};

/// Default time-to-live for entries
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default maximum number of entries
pub const DEFAULT_MAX_ITEMS: usize = 100;

/// Default maximum total payload size in bytes
pub const DEFAULT_MAX_SIZE: usize = 5 * 1024 * 1024; // 5 MB

/// Default namespace prefix
pub const DEFAULT_NAMESPACE: &str = "api-cache";

/// Default stale window before expiry
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(60);

/// Default deadline for a single backend operation
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

// == Storage Type ==
/// Which backend holds the entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    Memory,
    PersistentKv,
}

// == Eviction Policy ==
/// Rule used to pick victims when the cache is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    Fifo,
    Priority,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Fifo => "fifo",
            EvictionPolicy::Priority => "priority",
        };
        f.write_str(s)
    }
}

impl FromStr for EvictionPolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            "priority" => Ok(EvictionPolicy::Priority),
            other => Err(CacheError::InvalidRequest(format!(
                "unknown eviction policy '{}'",
                other
            ))),
        }
    }
}

// == Cache Options ==
/// Configuration for a single cache instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub max_items: usize,
    /// Upper bound on the summed entry sizes, in bytes
    pub max_size: usize,
    pub storage_type: StorageType,
    pub eviction_policy: EvictionPolicy,
    pub stale_while_revalidate: bool,
    /// Width of the stale window that ends at expiry
    pub stale_time: Duration,
    pub default_priority: Priority,
    pub track_dependencies: bool,
    /// Key prefix partitioning a shared backend
    pub namespace: String,
    /// Log every emitted event
    pub debug: bool,
    pub backend_timeout: Duration,
    /// File used when `storage_type` is `PersistentKv`
    pub storage_path: PathBuf,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_items: DEFAULT_MAX_ITEMS,
            max_size: DEFAULT_MAX_SIZE,
            storage_type: StorageType::Memory,
            eviction_policy: EvictionPolicy::Lru,
            stale_while_revalidate: false,
            stale_time: DEFAULT_STALE_TIME,
            default_priority: Priority::Normal,
            track_dependencies: false,
            namespace: DEFAULT_NAMESPACE.to_string(),
            debug: false,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            storage_path: PathBuf::from("api-cache.json"),
        }
    }
}

impl CacheOptions {
    /// Starts a builder from the defaults.
    pub fn builder() -> CacheOptionsBuilder {
        CacheOptionsBuilder::default()
    }

    /// True when entries live in the persistent key-value store.
    pub fn is_persistent(&self) -> bool {
        self.storage_type == StorageType::PersistentKv
    }

    /// Rejects option combinations the cache cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_items == 0 {
            return Err(CacheError::InvalidRequest(
                "max_items must be greater than zero".to_string(),
            ));
        }
        if self.max_size == 0 {
            return Err(CacheError::InvalidRequest(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidRequest(
                "ttl must be greater than zero".to_string(),
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(CacheError::InvalidRequest(format!(
                "namespace '{}' must be non-empty and must not contain ':'",
                self.namespace
            )));
        }
        if self.stale_while_revalidate && self.stale_time >= self.ttl {
            return Err(CacheError::InvalidRequest(
                "stale_time must be shorter than ttl".to_string(),
            ));
        }
        Ok(())
    }
}

// == Builder ==
/// Builder for [`CacheOptions`].
#[derive(Debug, Default)]
pub struct CacheOptionsBuilder {
    options: CacheOptions,
}

impl CacheOptionsBuilder {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.options.ttl = ttl;
        self
    }

    pub fn max_items(mut self, max_items: usize) -> Self {
        self.options.max_items = max_items;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.options.max_size = max_size;
        self
    }

    /// Shorthand for selecting the persistent or memory backend.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.options.storage_type = if persistent {
            StorageType::PersistentKv
        } else {
            StorageType::Memory
        };
        self
    }

    pub fn storage_type(mut self, storage_type: StorageType) -> Self {
        self.options.storage_type = storage_type;
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.options.eviction_policy = policy;
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.options.stale_while_revalidate = enabled;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.options.stale_time = stale_time;
        self
    }

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.options.default_priority = priority;
        self
    }

    pub fn track_dependencies(mut self, enabled: bool) -> Self {
        self.options.track_dependencies = enabled;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.options.namespace = namespace.into();
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.options.debug = debug;
        self
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.options.backend_timeout = timeout;
        self
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.storage_path = path.into();
        self
    }

    pub fn build(self) -> CacheOptions {
        self.options
    }
}

// == Set Options ==
/// Per-write overrides for [`GenericCache::set`](crate::cache::GenericCache::set).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub priority: Option<Priority>,
    pub dependencies: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = keys.into_iter().map(Into::into).collect();
        self
    }
}
