//! Eviction Engine Module
//!
//! Chooses which entries to drop when an insert would exceed the item or byte
//! limits.
//!
//! CRITICAL entries are never chosen, with one exception: when the store holds
//! exactly one entry, that entry is CRITICAL, and the incoming entry is also
//! CRITICAL, the resident entry is replaced. Any other insert that cannot be
//! made to fit fails with `CapacityExceeded`.

use std::cmp::Ordering;

use crate::cache::{CacheEntry, EvictionPolicy, Priority};
use crate::error::{CacheError, Result};

// == Eviction Engine ==
#[derive(Debug, Clone, Copy)]
pub struct EvictionEngine {
    policy: EvictionPolicy,
    max_items: usize,
    max_size: usize,
}

impl EvictionEngine {
    pub fn new(policy: EvictionPolicy, max_items: usize, max_size: usize) -> Self {
        Self {
            policy,
            max_items,
            max_size,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    // == Admit ==
    /// Returns the keys that must be evicted, in eviction order, before
    /// `incoming` can be stored under `key`.
    ///
    /// An existing entry under `key` is being replaced and so never counts
    /// against the limits.
    pub fn admit<T>(
        &self,
        key: &str,
        incoming: &CacheEntry<T>,
        current: &[(String, CacheEntry<T>)],
    ) -> Result<Vec<String>> {
        let incoming_size = incoming.size.unwrap_or(0);
        if incoming_size > self.max_size {
            return Err(CacheError::CapacityExceeded(format!(
                "entry '{}' is {} bytes, larger than max_size {}",
                key, incoming_size, self.max_size
            )));
        }

        let mut resident: Vec<&(String, CacheEntry<T>)> =
            current.iter().filter(|(k, _)| k != key).collect();
        let mut count = resident.len();
        let mut bytes: usize = resident.iter().map(|(_, e)| e.size.unwrap_or(0)).sum();

        if self.fits(count, bytes, incoming_size) {
            return Ok(Vec::new());
        }

        resident.sort_by(|a, b| self.compare(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));

        let mut victims = Vec::new();
        for (k, entry) in resident.iter().filter(|(_, e)| e.priority != Priority::Critical) {
            if self.fits(count, bytes, incoming_size) {
                break;
            }
            victims.push(k.clone());
            count -= 1;
            bytes = bytes.saturating_sub(entry.size.unwrap_or(0));
        }

        if !self.fits(count, bytes, incoming_size)
            && resident.len() == 1
            && incoming.priority == Priority::Critical
        {
            let (k, _) = resident[0];
            victims.push(k.clone());
            count = 0;
            bytes = 0;
        }

        if self.fits(count, bytes, incoming_size) {
            Ok(victims)
        } else {
            Err(CacheError::CapacityExceeded(format!(
                "cannot make room for '{}': remaining entries are CRITICAL",
                key
            )))
        }
    }

    fn fits(&self, count: usize, bytes: usize, incoming_size: usize) -> bool {
        count < self.max_items && bytes.saturating_add(incoming_size) <= self.max_size
    }

    /// Orders entries so the first one is the preferred victim.
    fn compare<T>(&self, a: &CacheEntry<T>, b: &CacheEntry<T>) -> Ordering {
        let by_recency = |a: &CacheEntry<T>, b: &CacheEntry<T>| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then(a.access_seq.cmp(&b.access_seq))
        };
        match self.policy {
            EvictionPolicy::Lru => by_recency(a, b),
            EvictionPolicy::Lfu => a.access_count.cmp(&b.access_count).then_with(|| by_recency(a, b)),
            EvictionPolicy::Fifo => a
                .timestamp
                .cmp(&b.timestamp)
                .then(a.insert_seq.cmp(&b.insert_seq)),
            EvictionPolicy::Priority => a.priority.cmp(&b.priority).then_with(|| by_recency(a, b)),
        }
    }
}
