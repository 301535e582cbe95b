//! Cache Module
//!
//! Generic response cache with pluggable storage, TTL expiry,
//! stale-while-revalidate, policy-driven eviction and dependency-aware
//! invalidation.

mod backend;
mod clock;
mod dependency;
mod entry;
mod events;
mod eviction;
mod freshness;
mod options;
mod persistent;
mod stats;
mod store;


use serde::de::DeserializeOwned;
use serde::Serialize;

// Re-export public types
pub use backend::{MemoryBackend, StorageBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dependency::{Cascade, DependencyGraph};
pub use entry::{current_timestamp_ms, CacheEntry, EntryState, Priority};
pub use events::{CacheEvent, CacheEventType, EventBus, Subscription};
pub use eviction::EvictionEngine;
pub use freshness::{FreshnessPolicy, ReadOutcome};
pub use options::{CacheOptions, CacheOptionsBuilder, EvictionPolicy, SetOptions, StorageType};
pub use persistent::{PersistedRecord, PersistentBackend};
pub use stats::{CacheStats, StatsRecorder};
pub use store::{CacheHit, GenericCache, InvalidationReport};

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;

/// Values a [`GenericCache`] can hold: cloned out on every read and
/// serializable for size estimates and persistent storage.
pub trait Cacheable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}
