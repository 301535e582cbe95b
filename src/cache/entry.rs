//! Cache Entry Module
//!
//! Defines cache entries with freshness state, priority and access metadata.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// == Entry State ==
/// Freshness state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    Valid,
    Expired,
    Stale,
    Refreshing,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::Valid => "VALID",
            EntryState::Expired => "EXPIRED",
            EntryState::Stale => "STALE",
            EntryState::Refreshing => "REFRESHING",
        };
        f.write_str(s)
    }
}

// == Priority ==
/// Eviction priority. Ordering is `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

// == Cache Entry ==
/// A single cache entry: payload plus freshness and access metadata.
///
/// All timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    /// Key within the owning cache's namespace
    pub key: String,
    /// The cached payload
    pub data: T,
    /// Creation time
    pub timestamp: u64,
    /// Absolute expiry time, never earlier than `timestamp`
    pub expires: u64,
    pub state: EntryState,
    /// Estimated encoded size in bytes
    pub size: Option<usize>,
    pub priority: Priority,
    /// Number of hits served from this entry; only ever increases
    pub access_count: u64,
    pub last_accessed: u64,
    /// Keys this entry depends on
    pub dependencies: BTreeSet<String>,
    pub metadata: HashMap<String, Value>,
    /// Insertion sequence, breaks ties between equal timestamps
    #[serde(default)]
    pub insert_seq: u64,
    /// Access sequence, breaks ties between equal `last_accessed` values
    #[serde(default)]
    pub access_seq: u64,
}

impl<T> CacheEntry<T> {
    // == Constructor ==
    /// Creates a VALID entry stamped at `now` that expires after `ttl_ms`.
    pub fn new(key: impl Into<String>, data: T, now: u64, ttl_ms: u64) -> Self {
        Self {
            key: key.into(),
            data,
            timestamp: now,
            expires: now.saturating_add(ttl_ms),
            state: EntryState::Valid,
            size: None,
            priority: Priority::default(),
            access_count: 0,
            last_accessed: now,
            dependencies: BTreeSet::new(),
            metadata: HashMap::new(),
            insert_seq: 0,
            access_seq: 0,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the dependency set.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    // == Is Expired ==
    /// Returns true once `now` has reached the expiry time.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires
    }

    /// Configured lifetime of this entry in milliseconds.
    pub fn ttl_ms(&self) -> u64 {
        self.expires.saturating_sub(self.timestamp)
    }

    // == Time To Live ==
    /// Remaining lifetime in milliseconds, zero once expired.
    pub fn ttl_remaining_ms(&self, now: u64) -> u64 {
        self.expires.saturating_sub(now)
    }

    /// Records a served hit.
    pub fn mark_accessed(&mut self, now: u64, seq: u64) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = now;
        self.access_seq = seq;
    }
}

impl<T: Serialize> CacheEntry<T> {
    /// Estimates the payload size from its JSON encoding.
    pub fn estimate_size(&self) -> usize {
        serde_json::to_vec(&self.data)
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
