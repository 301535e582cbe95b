//! Configuration Module
//!
//! Loads server and cache configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::cache::{CacheOptions, EvictionPolicy, StorageType};

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Options for the served cache
    pub cache: CacheOptions,
    /// HTTP server port
    pub server_port: u16,
    /// Background cleanup task interval in seconds
    pub cleanup_interval: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_TTL_MS` - Default TTL in milliseconds (default: 300000)
    /// - `CACHE_MAX_ITEMS` - Maximum cache entries (default: 100)
    /// - `CACHE_MAX_SIZE` - Maximum total payload bytes (default: 5 MB)
    /// - `CACHE_NAMESPACE` - Key namespace (default: api-cache)
    /// - `CACHE_PERSISTENT` - Use the file-backed store (default: false)
    /// - `CACHE_STORAGE_PATH` - File for the persistent store (default: api-cache.json)
    /// - `CACHE_EVICTION_POLICY` - lru, lfu, fifo or priority (default: lru)
    /// - `CACHE_SWR` - Enable stale-while-revalidate (default: false)
    /// - `CACHE_STALE_TIME_MS` - Stale window in milliseconds (default: 60000)
    /// - `CACHE_TRACK_DEPENDENCIES` - Cascade invalidation (default: false)
    /// - `CACHE_DEBUG` - Log every cache event (default: false)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `CLEANUP_INTERVAL` - Cleanup frequency in seconds (default: 1)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a Config from any variable source. Unparseable values are
    /// logged and replaced by their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = CacheOptions::default();
        let parsed = |name: &str| lookup(name).map(|raw| (name.to_string(), raw));

        let storage_type = if parse_or(parsed("CACHE_PERSISTENT"), false) {
            StorageType::PersistentKv
        } else {
            StorageType::Memory
        };

        let cache = CacheOptions {
            ttl: Duration::from_millis(parse_or(
                parsed("CACHE_TTL_MS"),
                defaults.ttl.as_millis() as u64,
            )),
            max_items: parse_or(parsed("CACHE_MAX_ITEMS"), defaults.max_items),
            max_size: parse_or(parsed("CACHE_MAX_SIZE"), defaults.max_size),
            storage_type,
            eviction_policy: parse_or::<EvictionPolicy>(
                parsed("CACHE_EVICTION_POLICY"),
                defaults.eviction_policy,
            ),
            stale_while_revalidate: parse_or(parsed("CACHE_SWR"), defaults.stale_while_revalidate),
            stale_time: Duration::from_millis(parse_or(
                parsed("CACHE_STALE_TIME_MS"),
                defaults.stale_time.as_millis() as u64,
            )),
            track_dependencies: parse_or(
                parsed("CACHE_TRACK_DEPENDENCIES"),
                defaults.track_dependencies,
            ),
            namespace: lookup("CACHE_NAMESPACE").unwrap_or(defaults.namespace.clone()),
            debug: parse_or(parsed("CACHE_DEBUG"), defaults.debug),
            storage_path: lookup("CACHE_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_path.clone()),
            ..defaults
        };

        Self {
            cache,
            server_port: parse_or(parsed("SERVER_PORT"), 3000),
            cleanup_interval: parse_or(parsed("CLEANUP_INTERVAL"), 1),
        }
    }
}

fn parse_or<T: FromStr>(var: Option<(String, String)>, default: T) -> T {
    match var {
        None => default,
        Some((name, raw)) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = %name, value = %raw, "ignoring unparseable configuration value");
            default
        }),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheOptions::default(),
            server_port: 3000,
            cleanup_interval: 1,
        }
    }
}
