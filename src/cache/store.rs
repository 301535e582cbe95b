//! Generic Cache Module
//!
//! The public cache: entry store, eviction, freshness and dependency tracking
//! behind one async API.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::backend::{MemoryBackend, StorageBackend};
use crate::cache::clock::{Clock, SystemClock};
use crate::cache::dependency::{Cascade, DependencyGraph};
use crate::cache::eviction::EvictionEngine;
use crate::cache::events::{CacheEvent, CacheEventType, EventBus, Subscription};
use crate::cache::freshness::{FreshnessPolicy, ReadOutcome};
use crate::cache::persistent::PersistentBackend;
use crate::cache::stats::{CacheStats, StatsRecorder};
use crate::cache::{
    CacheEntry, CacheOptions, Cacheable, EntryState, SetOptions, StorageType, MAX_KEY_LENGTH,
};
use crate::error::{CacheError, Result};

// == Lookup Result ==
/// A value served from the cache together with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
    pub value: T,
    /// VALID, STALE or REFRESHING at the time of the read
    pub state: EntryState,
    /// True for exactly one reader per stale period: that reader should
    /// fetch a fresh value and hand it to `complete_refresh`.
    pub should_revalidate: bool,
}

/// Outcome of [`GenericCache::invalidate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Keys actually removed, root first
    pub removed: Vec<String>,
    pub cycle_detected: bool,
}

/// State guarded by the operation lock.
#[derive(Debug, Default)]
struct CacheState {
    graph: DependencyGraph,
    graph_loaded: bool,
    /// Logical clock for eviction tie-breaks
    seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

// == Generic Cache ==
/// A namespaced cache over a pluggable [`StorageBackend`].
///
/// Every operation takes one async lock for its whole duration, so operations
/// on the same key never interleave. Events are emitted under that lock and
/// therefore reach listeners in operation order.
pub struct GenericCache<T: Cacheable> {
    options: CacheOptions,
    backend: Arc<dyn StorageBackend<T>>,
    clock: Arc<dyn Clock>,
    eviction: EvictionEngine,
    freshness: FreshnessPolicy,
    events: EventBus,
    stats: StatsRecorder,
    state: Mutex<CacheState>,
}

impl<T: Cacheable> fmt::Debug for GenericCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericCache")
            .field("namespace", &self.options.namespace)
            .field("backend", &self.backend.name())
            .field("policy", &self.eviction.policy())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl<T: Cacheable> GenericCache<T> {
    // == Constructors ==
    /// Creates a cache with the backend selected by `options.storage_type`.
    pub fn new(options: CacheOptions) -> Result<Self> {
        let backend: Arc<dyn StorageBackend<T>> = match options.storage_type {
            StorageType::Memory => Arc::new(MemoryBackend::new()),
            StorageType::PersistentKv => Arc::new(PersistentBackend::new(
                options.storage_path.clone(),
                options.namespace.clone(),
            )),
        };
        Self::with_backend(options, backend)
    }

    /// Creates a cache over a caller-supplied backend.
    pub fn with_backend(options: CacheOptions, backend: Arc<dyn StorageBackend<T>>) -> Result<Self> {
        options.validate()?;
        info!(
            namespace = %options.namespace,
            backend = backend.name(),
            policy = %options.eviction_policy,
            max_items = options.max_items,
            "cache initialized"
        );

        Ok(Self {
            eviction: EvictionEngine::new(
                options.eviction_policy,
                options.max_items,
                options.max_size,
            ),
            freshness: FreshnessPolicy::new(options.stale_while_revalidate, options.stale_time),
            events: EventBus::new(options.namespace.clone(), options.debug),
            stats: StatsRecorder::new(),
            state: Mutex::new(CacheState::default()),
            clock: Arc::new(SystemClock),
            backend,
            options,
        })
    }

    /// Replaces the time source. Call before sharing the cache.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    // == Get ==
    /// Returns the cached value, or `None` on a miss, an expired entry, or a
    /// backend failure.
    pub async fn get(&self, key: &str) -> Option<T> {
        self.lookup(key).await.map(|hit| hit.value)
    }

    /// Like [`get`](Self::get), but also reports freshness and whether the
    /// caller should revalidate.
    pub async fn lookup(&self, key: &str) -> Option<CacheHit<T>> {
        let mut state = self.state.lock().await;
        let now = self.now();

        let mut entry = match self.call("get", self.backend.get(key)).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(key, "cache miss");
                self.stats.record_miss();
                self.emit(CacheEventType::Miss, Some(key), None);
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                self.stats.record_miss();
                self.emit(
                    CacheEventType::Error,
                    Some(key),
                    Some(json!({
                        "operation": "get",
                        "error": e.to_string(),
                        "backend": e.is_backend_fault(),
                    })),
                );
                return None;
            }
        };

        let served_state = self.freshness.classify(&entry, now);
        let outcome = self.freshness.on_read(&mut entry, now);
        if outcome == ReadOutcome::Expired {
            debug!(key, "cache entry expired");
            self.stats.record_miss();
            self.expire(&mut state, key).await;
            return None;
        }

        let seq = state.next_seq();
        entry.mark_accessed(now, seq);
        let mut should_revalidate = outcome == ReadOutcome::Stale { revalidate: true };
        let ttl_remaining = entry.ttl_remaining_ms(now);
        let value = entry.data.clone();

        // An unrecorded refresh claim is withdrawn so a later reader can make it
        if let Err(e) = self.call("set", self.backend.set(key, entry)).await {
            warn!(key, error = %e, "failed to record access metadata");
            should_revalidate = false;
            self.emit(
                CacheEventType::Error,
                Some(key),
                Some(json!({
                    "operation": "touch",
                    "error": e.to_string(),
                    "backend": e.is_backend_fault(),
                })),
            );
        }

        debug!(key, state = %served_state, should_revalidate, "cache hit");
        self.stats.record_hit();
        self.emit(
            CacheEventType::Hit,
            Some(key),
            Some(json!({
                "state": served_state,
                "revalidate": should_revalidate,
                "ttl_remaining": ttl_remaining,
            })),
        );

        Some(CacheHit {
            value,
            state: served_state,
            should_revalidate,
        })
    }

    // == Set ==
    /// Stores `value` under `key` with the cache defaults.
    pub async fn set(&self, key: &str, value: T) -> Result<()> {
        self.set_with(key, value, SetOptions::default()).await
    }

    /// Stores `value` under `key`, evicting per policy if the cache is full.
    ///
    /// Fails with `CapacityExceeded` when no eviction can make room, and with
    /// `BackendUnavailable` when the write could not be committed.
    pub async fn set_with(&self, key: &str, value: T, options: SetOptions) -> Result<()> {
        validate_key(key)?;
        let mut state = self.state.lock().await;
        let now = self.now();

        let ttl = options.ttl.unwrap_or(self.options.ttl);
        let seq = state.next_seq();
        let mut entry = CacheEntry::new(key, value, now, ttl.as_millis() as u64)
            .with_priority(options.priority.unwrap_or(self.options.default_priority))
            .with_dependencies(options.dependencies);
        entry.insert_seq = seq;
        entry.access_seq = seq;
        entry.size = Some(entry.estimate_size());

        self.store_entry(&mut state, entry).await
    }

    /// Admits, writes and announces a fully built entry.
    async fn store_entry(&self, state: &mut CacheState, mut entry: CacheEntry<T>) -> Result<()> {
        let key = entry.key.clone();
        let now = self.now();

        if self.options.track_dependencies {
            self.ensure_graph(state).await;
            entry.dependencies.extend(state.graph.dependencies_of(&key));
        }

        let current = self.call("entries", self.backend.entries()).await.map_err(|e| {
            self.report_write_failure("set", &key, &e);
            e
        })?;
        let existed = current.iter().any(|(k, _)| *k == key);

        // Expired entries go first, as expirations rather than evictions
        let mut live = Vec::with_capacity(current.len());
        for (k, e) in current {
            if k != key && e.is_expired(now) {
                self.expire(state, &k).await;
            } else {
                live.push((k, e));
            }
        }

        let victims = self.eviction.admit(&key, &entry, &live).map_err(|e| {
            self.report_write_failure("set", &key, &e);
            e
        })?;

        let data = json!({
            "ttl": entry.ttl_ms(),
            "priority": entry.priority,
            "size": entry.size,
        });
        let dependencies = entry.dependencies.clone();
        let mut previous = live
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, e)| e.clone());
        self.call("set", self.backend.set(&key, entry))
            .await
            .map_err(|e| {
                self.report_write_failure("set", &key, &e);
                e
            })?;

        // Room is made only once the new entry is committed
        let mut evicted: Vec<&str> = Vec::with_capacity(victims.len());
        for victim in &victims {
            if let Err(e) = self.call("delete", self.backend.delete(victim)).await {
                self.report_write_failure("evict", victim, &e);
                self.roll_back(&key, previous.take(), &live, &evicted).await;
                return Err(e);
            }
            evicted.push(victim);
        }
        for victim in &victims {
            state.graph.remove(victim);
            self.stats.record_eviction();
            debug!(key = %victim, policy = %self.eviction.policy(), "evicted entry");
            self.emit(
                CacheEventType::Evict,
                Some(victim.as_str()),
                Some(json!({ "policy": self.eviction.policy(), "incoming": key })),
            );
        }

        if self.options.track_dependencies {
            state.graph.replace(&key, dependencies);
        }
        debug!(key = %key, "cache set");
        self.emit(CacheEventType::Set, Some(&key), Some(data));

        if existed && self.options.track_dependencies {
            self.invalidate_dependents(state, &key).await?;
        }
        self.sync_size().await;
        Ok(())
    }

    // == Delete ==
    /// Removes `key`, returning whether it was present. With dependency
    /// tracking on, its dependents are invalidated too.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if self.options.track_dependencies {
            self.ensure_graph(&mut state).await;
        }

        let removed = self
            .call("delete", self.backend.delete(key))
            .await
            .map_err(|e| {
                self.report_write_failure("delete", key, &e);
                e
            })?;
        state.graph.remove(key);
        self.emit(CacheEventType::Delete, Some(key), Some(json!({ "removed": removed })));

        if removed && self.options.track_dependencies {
            self.invalidate_dependents(&mut state, key).await?;
        }
        self.sync_size().await;
        Ok(removed)
    }

    // == Has ==
    /// True if `key` holds an unexpired entry. Does not count as a hit or
    /// miss; an expired entry found here is removed.
    pub async fn has(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        match self.call("get", self.backend.get(key)).await {
            Ok(Some(entry)) if entry.is_expired(self.now()) => {
                self.expire(&mut state, key).await;
                false
            }
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(key, error = %e, "cache lookup failed, reporting absent");
                self.emit(
                    CacheEventType::Error,
                    Some(key),
                    Some(json!({
                        "operation": "has",
                        "error": e.to_string(),
                        "backend": e.is_backend_fault(),
                    })),
                );
                false
            }
        }
    }

    // == Clear ==
    /// Removes every entry in this cache's namespace. Clearing an empty cache
    /// is a no-op.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let count = self.call("size", self.backend.size()).await.unwrap_or(0);

        self.call("clear", self.backend.clear())
            .await
            .map_err(|e| {
                self.report_write_failure("clear", "", &e);
                e
            })?;
        state.graph.clear();
        state.graph_loaded = true;
        self.stats.set_size(0);

        info!(namespace = %self.options.namespace, removed = count, "cache cleared");
        self.emit(CacheEventType::Clear, None, Some(json!({ "removed": count })));
        Ok(())
    }

    // == Invalidate ==
    /// Removes `key` and, with dependency tracking on, every entry that
    /// transitively depends on it. A dependency cycle is logged and the
    /// cascade still terminates.
    pub async fn invalidate(&self, key: &str) -> Result<InvalidationReport> {
        let mut state = self.state.lock().await;

        let cascade = if self.options.track_dependencies {
            self.ensure_graph(&mut state).await;
            state.graph.cascade(key)
        } else {
            Cascade {
                keys: vec![key.to_string()],
                cycle: None,
            }
        };

        if let Some(cycle) = &cascade.cycle {
            warn!(key, "{}", CacheError::DependencyCycle(cycle.clone()));
        }

        let mut report = InvalidationReport {
            removed: Vec::new(),
            cycle_detected: cascade.cycle.is_some(),
        };
        for k in &cascade.keys {
            if self.remove_for_invalidation(&mut state, k, key).await? {
                report.removed.push(k.clone());
            }
        }

        debug!(key, removed = report.removed.len(), "invalidated");
        self.sync_size().await;
        Ok(report)
    }

    /// Invalidates everything depending on `key`, but not `key` itself.
    async fn invalidate_dependents(&self, state: &mut CacheState, key: &str) -> Result<()> {
        let cascade = state.graph.cascade(key);
        if let Some(cycle) = &cascade.cycle {
            warn!(key, "{}", CacheError::DependencyCycle(cycle.clone()));
        }
        for k in cascade.keys.iter().filter(|k| k.as_str() != key) {
            self.remove_for_invalidation(state, k, key).await?;
        }
        Ok(())
    }

    async fn remove_for_invalidation(
        &self,
        state: &mut CacheState,
        key: &str,
        source: &str,
    ) -> Result<bool> {
        let removed = self
            .call("delete", self.backend.delete(key))
            .await
            .map_err(|e| {
                self.report_write_failure("invalidate", key, &e);
                e
            })?;
        state.graph.remove(key);
        if removed {
            self.emit(
                CacheEventType::Delete,
                Some(key),
                Some(json!({ "removed": true, "reason": "invalidated", "source": source })),
            );
        }
        Ok(removed)
    }

    /// Records that `key` depends on each of `depends_on`. The edges also
    /// land in the stored entry when one exists.
    pub async fn declare_dependency<I, S>(&self, key: &str, depends_on: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.options.track_dependencies {
            return Err(CacheError::InvalidRequest(
                "dependency tracking is disabled for this cache".to_string(),
            ));
        }
        let deps: Vec<String> = depends_on.into_iter().map(Into::into).collect();
        let mut state = self.state.lock().await;
        self.ensure_graph(&mut state).await;
        state.graph.declare(key, deps.iter().cloned());

        if let Some(mut entry) = self.call("get", self.backend.get(key)).await? {
            entry.dependencies.extend(deps);
            self.call("set", self.backend.set(key, entry)).await?;
        }
        Ok(())
    }

    // == Refresh ==
    /// Replaces a refreshing entry with a fresh value, keeping its priority,
    /// dependencies, access history and TTL length.
    ///
    /// Returns `false` and drops `value` when no refresh is pending for `key`:
    /// the entry was deleted, invalidated or evicted meanwhile, or a newer
    /// value was written.
    pub async fn complete_refresh(&self, key: &str, value: T) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = self.now();
        let previous = self
            .call("get", self.backend.get(key))
            .await
            .map_err(|e| {
                self.report_write_failure("refresh", key, &e);
                e
            })?;

        let Some(old) = previous else {
            debug!(key, "entry gone before refresh completed, dropping value");
            return Ok(false);
        };
        let pending = matches!(old.state, EntryState::Refreshing | EntryState::Stale)
            || self.freshness.classify(&old, now) == EntryState::Stale;
        if !pending {
            debug!(key, state = %old.state, "no refresh pending, dropping value");
            return Ok(false);
        }

        let mut entry = CacheEntry::new(key, value, now, old.ttl_ms()).with_priority(old.priority);
        entry.dependencies = old.dependencies;
        entry.metadata = old.metadata;
        entry.access_count = old.access_count;
        entry.last_accessed = old.last_accessed;
        entry.access_seq = old.access_seq;
        entry.insert_seq = state.next_seq();
        entry.size = Some(entry.estimate_size());

        self.store_entry(&mut state, entry).await?;
        Ok(true)
    }

    /// Records a failed refresh. The stale value stays available unless its
    /// TTL ran out meanwhile, in which case it is removed.
    pub async fn fail_refresh(&self, key: &str) -> Result<Option<EntryState>> {
        let mut state = self.state.lock().await;
        let now = self.now();
        let Some(mut entry) = self.call("get", self.backend.get(key)).await? else {
            return Ok(None);
        };

        let next = self.freshness.on_refresh_failure(&mut entry, now);
        if next == EntryState::Expired {
            self.expire(&mut state, key).await;
        } else {
            self.call("set", self.backend.set(key, entry)).await?;
            self.emit(
                CacheEventType::Error,
                Some(key),
                Some(json!({ "operation": "refresh", "state": next })),
            );
        }
        Ok(Some(next))
    }

    /// Returns the cached value or loads it with `fetch`.
    ///
    /// On a miss `fetch` is awaited and its value stored. On a stale hit the
    /// stale value is returned at once and, if this caller owns the refresh,
    /// `fetch` runs in a background task.
    pub async fn get_or_fetch<F, Fut>(self: &Arc<Self>, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(hit) = self.lookup(key).await {
            if hit.should_revalidate {
                let cache = Arc::clone(self);
                let key = key.to_string();
                tokio::spawn(async move {
                    match fetch().await {
                        Ok(value) => {
                            match cache.complete_refresh(&key, value).await {
                                Ok(true) => debug!(key = %key, "background refresh stored"),
                                Ok(false) => {}
                                Err(e) => {
                                    warn!(key = %key, error = %e, "failed to store refreshed value")
                                }
                            }
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "background refresh failed");
                            if let Err(e) = cache.fail_refresh(&key).await {
                                warn!(key = %key, error = %e, "failed to record refresh failure");
                            }
                        }
                    }
                });
            }
            return Ok(hit.value);
        }

        let value = fetch().await?;
        if let Err(e) = self.set(key, value.clone()).await {
            warn!(key, error = %e, "proceeding without caching fetched value");
        }
        Ok(value)
    }

    // == Maintenance ==
    /// Removes every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = self.now();
        let entries = self.call("entries", self.backend.entries()).await?;

        let mut removed = 0;
        for (key, entry) in entries {
            if entry.is_expired(now) {
                self.expire(&mut state, &key).await;
                removed += 1;
            }
        }
        self.sync_size().await;
        Ok(removed)
    }

    // == Introspection ==
    /// Keys currently stored, sorted. May include expired entries that have
    /// not been read or purged yet.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let _state = self.state.lock().await;
        let mut keys = self.call("keys", self.backend.keys()).await?;
        keys.sort();
        Ok(keys)
    }

    pub async fn len(&self) -> Result<usize> {
        let _state = self.state.lock().await;
        self.call("size", self.backend.size()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Registers an event listener for as long as the returned
    /// [`Subscription`] is kept.
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    // == Internals ==
    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn emit(&self, event_type: CacheEventType, key: Option<&str>, data: Option<Value>) {
        let event = CacheEvent::new(event_type, key, self.now());
        self.events.emit(match data {
            Some(data) => event.with_data(data),
            None => event,
        });
    }

    /// Runs a backend operation under the configured deadline.
    async fn call<R>(&self, op: &str, fut: impl Future<Output = Result<R>>) -> Result<R> {
        match tokio::time::timeout(self.options.backend_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::BackendUnavailable(format!(
                "{} backend {} timed out after {:?}",
                self.backend.name(),
                op,
                self.options.backend_timeout
            ))),
        }
    }

    fn report_write_failure(&self, op: &str, key: &str, err: &CacheError) {
        error!(operation = op, key, error = %err, "cache write failed");
        let key = (!key.is_empty()).then_some(key);
        self.emit(
            CacheEventType::Error,
            key,
            Some(json!({
                "operation": op,
                "error": err.to_string(),
                "backend": err.is_backend_fault(),
            })),
        );
    }

    /// Undoes a write whose evictions failed part way: the evicted entries
    /// come back and `key` returns to its previous value, or goes away.
    async fn roll_back(
        &self,
        key: &str,
        previous: Option<CacheEntry<T>>,
        live: &[(String, CacheEntry<T>)],
        evicted: &[&str],
    ) {
        for (k, entry) in live.iter().filter(|(k, _)| evicted.contains(&k.as_str())) {
            if let Err(e) = self.call("set", self.backend.set(k, entry.clone())).await {
                error!(key = %k, error = %e, "could not restore evicted entry");
            }
        }
        let restored = match previous {
            Some(entry) => self.call("set", self.backend.set(key, entry)).await,
            None => self.call("delete", self.backend.delete(key)).await.map(|_| ()),
        };
        if let Err(e) = restored {
            error!(key, error = %e, "could not roll back cache write");
        }
    }

    async fn expire(&self, state: &mut CacheState, key: &str) {
        self.stats.record_expiration();
        match self.call("delete", self.backend.delete(key)).await {
            Ok(_) => state.graph.remove(key),
            Err(e) => warn!(key, error = %e, "failed to remove expired entry"),
        }
        self.sync_size().await;
        self.emit(CacheEventType::Expire, Some(key), None);
    }

    /// Builds the dependency index from stored entries the first time it is
    /// needed, so persisted dependencies survive a restart.
    async fn ensure_graph(&self, state: &mut CacheState) {
        if state.graph_loaded {
            return;
        }
        match self.call("entries", self.backend.entries()).await {
            Ok(entries) => {
                for (key, entry) in entries {
                    state.graph.declare(&key, entry.dependencies);
                }
                state.graph_loaded = true;
            }
            Err(e) => warn!(error = %e, "could not load dependency index"),
        }
    }

    async fn sync_size(&self) {
        match self.call("size", self.backend.size()).await {
            Ok(size) => self.stats.set_size(size),
            Err(e) => debug!(error = %e, "could not refresh size"),
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidRequest("Key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidRequest(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EvictionPolicy, ManualClock, Priority};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn cache_with(options: CacheOptions) -> (GenericCache<String>, ManualClock) {
        let clock = ManualClock::new(0);
        let cache = GenericCache::new(options).unwrap().with_clock(clock.clone());
        (cache, clock)
    }

    fn default_cache() -> (GenericCache<String>, ManualClock) {
        cache_with(CacheOptions::default())
    }

    fn record_events(cache: &GenericCache<String>) -> (Subscription, Arc<StdMutex<Vec<CacheEvent>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = cache.on_event(move |e| sink.lock().unwrap().push(e.clone()));
        (sub, seen)
    }

    /// Memory backend that can be switched into failure mode.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend<String>,
        failing: AtomicBool,
        /// Fails only `set`
        failing_sets: AtomicBool,
        /// Fails only deletes of this key
        undeletable: StdMutex<Option<String>>,
    }

    impl FlakyBackend {
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheError::BackendUnavailable("offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StorageBackend<String> for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<CacheEntry<String>>> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, entry: CacheEntry<String>) -> Result<()> {
            self.check()?;
            if self.failing_sets.load(Ordering::SeqCst) {
                return Err(CacheError::BackendUnavailable("read-only".to_string()));
            }
            self.inner.set(key, entry).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.check()?;
            if self.undeletable.lock().unwrap().as_deref() == Some(key) {
                return Err(CacheError::BackendUnavailable("locked".to_string()));
            }
            self.inner.delete(key).await
        }
        async fn has(&self, key: &str) -> Result<bool> {
            self.check()?;
            self.inner.has(key).await
        }
        async fn clear(&self) -> Result<()> {
            self.check()?;
            self.inner.clear().await
        }
        async fn keys(&self) -> Result<Vec<String>> {
            self.check()?;
            self.inner.keys().await
        }
        async fn entries(&self) -> Result<Vec<(String, CacheEntry<String>)>> {
            self.check()?;
            self.inner.entries().await
        }
        async fn size(&self) -> Result<usize> {
            self.check()?;
            self.inner.size().await
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Backend whose reads never finish in time.
    struct SlowBackend;

    #[async_trait]
    impl StorageBackend<String> for SlowBackend {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry<String>>> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(None)
        }
        async fn set(&self, _key: &str, _entry: CacheEntry<String>) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn has(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn clear(&self) -> Result<()> {
            Ok(())
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn entries(&self) -> Result<Vec<(String, CacheEntry<String>)>> {
            Ok(Vec::new())
        }
        async fn size(&self) -> Result<usize> {
            Ok(0)
        }
        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (cache, _clock) = default_cache();

        cache.set("key1", "value1".to_string()).await.unwrap();
        assert_eq!(cache.get("key1").await.as_deref(), Some("value1"));
        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_get_nonexistent_is_miss() {
        let (cache, _clock) = default_cache();
        let (_sub, seen) = record_events(&cache);

        assert!(cache.get("nonexistent").await.is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(seen.lock().unwrap()[0].event_type, CacheEventType::Miss);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (cache, _clock) = default_cache();

        cache.set("key1", "value1".to_string()).await.unwrap();
        cache.set("key1", "value2".to_string()).await.unwrap();

        assert_eq!(cache.get("key1").await.as_deref(), Some("value2"));
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let (cache, _clock) = default_cache();

        let err = cache.set("", "v".to_string()).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidRequest(_)));

        let long_key = "x".repeat(MAX_KEY_LENGTH + 1);
        assert!(cache.set(&long_key, "v".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_ttl_expiry_scenario() {
        let options = CacheOptions::builder().ttl(Duration::from_millis(1_000)).build();
        let (cache, clock) = cache_with(options);

        cache.set("user:1", "Ann".to_string()).await.unwrap();

        clock.set(500);
        assert_eq!(cache.get("user:1").await.as_deref(), Some("Ann"));
        assert_eq!(cache.stats().hits, 1);

        clock.set(1_500);
        assert!(cache.get("user:1").await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert!(!cache.keys().await.unwrap().contains(&"user:1".to_string()));
    }

    #[tokio::test]
    async fn test_per_entry_ttl_override() {
        let (cache, clock) = default_cache();
        cache
            .set_with("short", "v".to_string(), SetOptions::new().ttl(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.set("long", "v".to_string()).await.unwrap();

        clock.set(10);
        assert!(cache.get("short").await.is_none());
        assert!(cache.get("long").await.is_some());
    }

    #[tokio::test]
    async fn test_lru_scenario() {
        let options = CacheOptions::builder()
            .max_items(2)
            .eviction_policy(EvictionPolicy::Lru)
            .build();
        let (cache, _clock) = cache_with(options);

        cache.set("a", "1".to_string()).await.unwrap();
        cache.set("b", "2".to_string()).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", "3".to_string()).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_lfu_evicts_least_used() {
        let options = CacheOptions::builder()
            .max_items(2)
            .eviction_policy(EvictionPolicy::Lfu)
            .build();
        let (cache, clock) = cache_with(options);

        cache.set("a", "1".to_string()).await.unwrap();
        cache.set("b", "2".to_string()).await.unwrap();
        clock.advance(1);
        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();
        cache.get("b").await.unwrap();
        cache.set("c", "3".to_string()).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_fifo_ignores_access() {
        let options = CacheOptions::builder()
            .max_items(2)
            .eviction_policy(EvictionPolicy::Fifo)
            .build();
        let (cache, _clock) = cache_with(options);

        cache.set("a", "1".to_string()).await.unwrap();
        cache.set("b", "2".to_string()).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", "3".to_string()).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_critical_only_cache_rejects_insert() {
        let options = CacheOptions::builder().max_items(2).build();
        let (cache, _clock) = cache_with(options);
        let critical = SetOptions::new().priority(Priority::Critical);

        cache.set_with("a", "1".to_string(), critical.clone()).await.unwrap();
        cache.set_with("b", "2".to_string(), critical.clone()).await.unwrap();

        let err = cache.set("c", "3".to_string()).await.unwrap_err();
        assert!(matches!(err, CacheError::CapacityExceeded(_)));
        assert!(cache.get("c").await.is_none());
        assert_eq!(cache.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_eviction_emits_evict_event() {
        let options = CacheOptions::builder().max_items(1).build();
        let (cache, _clock) = cache_with(options);
        let (_sub, seen) = record_events(&cache);

        cache.set("a", "1".to_string()).await.unwrap();
        cache.set("b", "2".to_string()).await.unwrap();

        let types: Vec<_> = seen.lock().unwrap().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![CacheEventType::Set, CacheEventType::Evict, CacheEventType::Set]
        );
    }

    #[tokio::test]
    async fn test_max_size_enforced() {
        // Each "xxxxxxxx" encodes to 10 bytes of JSON
        let options = CacheOptions::builder().max_size(25).build();
        let (cache, _clock) = cache_with(options);

        cache.set("a", "xxxxxxxx".to_string()).await.unwrap();
        cache.set("b", "xxxxxxxx".to_string()).await.unwrap();
        cache.set("c", "xxxxxxxx".to_string()).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_entries_reclaimed_before_eviction() {
        let options = CacheOptions::builder().max_items(2).build();
        let (cache, clock) = cache_with(options);

        cache
            .set_with("old", "1".to_string(), SetOptions::new().ttl(Duration::from_millis(5)))
            .await
            .unwrap();
        cache.set("keep", "2".to_string()).await.unwrap();
        clock.set(10);
        cache.set("new", "3".to_string()).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec!["keep".to_string(), "new".to_string()]);
        let stats = cache.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_single_flight() {
        let options = CacheOptions::builder()
            .ttl(Duration::from_millis(1_000))
            .stale_while_revalidate(true)
            .stale_time(Duration::from_millis(300))
            .build();
        let (cache, clock) = cache_with(options);
        cache.set("k", "old".to_string()).await.unwrap();

        clock.set(100);
        let hit = cache.lookup("k").await.unwrap();
        assert_eq!(hit.state, EntryState::Valid);
        assert!(!hit.should_revalidate);

        clock.set(800);
        let mut signals = 0;
        for _ in 0..5 {
            let hit = cache.lookup("k").await.unwrap();
            assert_eq!(hit.value, "old");
            if hit.should_revalidate {
                signals += 1;
            }
        }
        assert_eq!(signals, 1);

        assert!(cache.complete_refresh("k", "new".to_string()).await.unwrap());
        let hit = cache.lookup("k").await.unwrap();
        assert_eq!(hit.value, "new");
        assert_eq!(hit.state, EntryState::Valid);

        // The refreshed entry keeps the original TTL length
        clock.set(800 + 999);
        assert!(cache.get("k").await.is_some());
        clock.set(800 + 1_000);
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_after_invalidation_is_dropped() {
        let options = CacheOptions::builder()
            .ttl(Duration::from_millis(1_000))
            .stale_while_revalidate(true)
            .stale_time(Duration::from_millis(300))
            .track_dependencies(true)
            .build();
        let (cache, clock) = cache_with(options);
        cache.set("a", "parent".to_string()).await.unwrap();
        cache
            .set_with("b", "child".to_string(), SetOptions::new().depends_on(["a"]))
            .await
            .unwrap();

        clock.set(800);
        assert!(cache.lookup("b").await.unwrap().should_revalidate);
        let report = cache.invalidate("a").await.unwrap();
        assert_eq!(report.removed, vec!["a", "b"]);

        assert!(!cache.complete_refresh("b", "late".to_string()).await.unwrap());
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_does_not_overwrite_newer_value() {
        let options = CacheOptions::builder()
            .ttl(Duration::from_millis(1_000))
            .stale_while_revalidate(true)
            .stale_time(Duration::from_millis(300))
            .build();
        let (cache, clock) = cache_with(options);
        cache.set("k", "old".to_string()).await.unwrap();

        clock.set(800);
        assert!(cache.lookup("k").await.unwrap().should_revalidate);
        cache.set("k", "written".to_string()).await.unwrap();

        assert!(!cache.complete_refresh("k", "fetched".to_string()).await.unwrap());
        assert_eq!(cache.get("k").await.as_deref(), Some("written"));
    }

    #[tokio::test]
    async fn test_refresh_read_failure_is_reported() {
        let backend = Arc::new(FlakyBackend::default());
        let cache: GenericCache<String> =
            GenericCache::with_backend(CacheOptions::default(), backend.clone()).unwrap();
        cache.set("k", "v".to_string()).await.unwrap();

        backend.failing.store(true, Ordering::SeqCst);
        let err = cache.complete_refresh("k", "new".to_string()).await.unwrap_err();
        assert!(matches!(err, CacheError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_data() {
        let options = CacheOptions::builder()
            .ttl(Duration::from_millis(1_000))
            .stale_while_revalidate(true)
            .stale_time(Duration::from_millis(300))
            .build();
        let (cache, clock) = cache_with(options);
        cache.set("k", "old".to_string()).await.unwrap();

        clock.set(800);
        assert!(cache.lookup("k").await.unwrap().should_revalidate);
        assert_eq!(cache.fail_refresh("k").await.unwrap(), Some(EntryState::Stale));

        let hit = cache.lookup("k").await.unwrap();
        assert_eq!(hit.value, "old");
        assert!(hit.should_revalidate, "a failed refresh may be retried");

        clock.set(1_200);
        assert_eq!(cache.fail_refresh("k").await.unwrap(), Some(EntryState::Expired));
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_or_fetch_miss_then_hit() {
        let cache = Arc::new(default_cache().0);

        let v = cache
            .get_or_fetch("k", || async { Ok("loaded".to_string()) })
            .await
            .unwrap();
        assert_eq!(v, "loaded");

        let v = cache
            .get_or_fetch("k", || async { Err(CacheError::Internal("unused".into())) })
            .await
            .unwrap();
        assert_eq!(v, "loaded");
    }

    #[tokio::test]
    async fn test_get_or_fetch_propagates_fetch_error() {
        let cache = Arc::new(default_cache().0);
        let err = cache
            .get_or_fetch("k", || async { Err(CacheError::Internal("origin down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Internal(_)));
    }

    #[tokio::test]
    async fn test_get_or_fetch_refreshes_in_background() {
        let options = CacheOptions::builder()
            .ttl(Duration::from_millis(1_000))
            .stale_while_revalidate(true)
            .stale_time(Duration::from_millis(300))
            .build();
        let (cache, clock) = cache_with(options);
        let cache = Arc::new(cache);
        cache.set("k", "old".to_string()).await.unwrap();

        clock.set(900);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let v = cache
            .get_or_fetch("k", move || async move {
                let _ = tx.send(());
                Ok("new".to_string())
            })
            .await
            .unwrap();
        assert_eq!(v, "old");

        rx.await.unwrap();
        for _ in 0..50 {
            if cache.get("k").await.as_deref() == Some("new") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background refresh never landed");
    }

    #[tokio::test]
    async fn test_dependency_cascade() {
        let options = CacheOptions::builder().track_dependencies(true).build();
        let (cache, _clock) = cache_with(options);

        cache.set("a", "1".to_string()).await.unwrap();
        cache
            .set_with("b", "2".to_string(), SetOptions::new().depends_on(["a"]))
            .await
            .unwrap();
        cache
            .set_with("c", "3".to_string(), SetOptions::new().depends_on(["b"]))
            .await
            .unwrap();
        cache.set("unrelated", "4".to_string()).await.unwrap();

        let report = cache.invalidate("a").await.unwrap();
        assert_eq!(report.removed, vec!["a", "b", "c"]);
        assert!(!report.cycle_detected);
        assert_eq!(cache.keys().await.unwrap(), vec!["unrelated".to_string()]);
    }

    #[tokio::test]
    async fn test_dependency_cycle_terminates() {
        let options = CacheOptions::builder().track_dependencies(true).build();
        let (cache, _clock) = cache_with(options);

        cache
            .set_with("a", "1".to_string(), SetOptions::new().depends_on(["b"]))
            .await
            .unwrap();
        cache
            .set_with("b", "2".to_string(), SetOptions::new().depends_on(["a"]))
            .await
            .unwrap();

        let report = cache.invalidate("a").await.unwrap();
        assert!(report.cycle_detected);
        assert_eq!(report.removed, vec!["a", "b"]);
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_invalidates_dependents_only() {
        let options = CacheOptions::builder().track_dependencies(true).build();
        let (cache, _clock) = cache_with(options);

        cache.set("a", "1".to_string()).await.unwrap();
        cache
            .set_with("b", "2".to_string(), SetOptions::new().depends_on(["a"]))
            .await
            .unwrap();
        cache.set("a", "1b".to_string()).await.unwrap();

        assert_eq!(cache.get("a").await.as_deref(), Some("1b"));
        assert!(cache.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_declare_dependency_then_delete() {
        let options = CacheOptions::builder().track_dependencies(true).build();
        let (cache, _clock) = cache_with(options);

        cache.set("list", "[..]".to_string()).await.unwrap();
        cache.set("item", "{..}".to_string()).await.unwrap();
        cache.declare_dependency("list", ["item"]).await.unwrap();

        assert!(cache.delete("item").await.unwrap());
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_declare_dependency_requires_tracking() {
        let (cache, _clock) = default_cache();
        assert!(cache.declare_dependency("a", ["b"]).await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_without_tracking_removes_only_key() {
        let (cache, _clock) = default_cache();
        cache.set("a", "1".to_string()).await.unwrap();
        cache
            .set_with("b", "2".to_string(), SetOptions::new().depends_on(["a"]))
            .await
            .unwrap();

        let report = cache.invalidate("a").await.unwrap();
        assert_eq!(report.removed, vec!["a"]);
        assert_eq!(cache.keys().await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let (cache, _clock) = default_cache();
        cache.set("k", "v".to_string()).await.unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_has_does_not_touch_stats() {
        let (cache, clock) = default_cache();
        cache
            .set_with("k", "v".to_string(), SetOptions::new().ttl(Duration::from_millis(10)))
            .await
            .unwrap();

        assert!(cache.has("k").await);
        assert!(!cache.has("missing").await);
        clock.set(10);
        assert!(!cache.has("k").await);

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_clear_twice_is_noop() {
        let (cache, _clock) = default_cache();
        cache.set("a", "1".to_string()).await.unwrap();

        cache.clear().await.unwrap();
        cache.clear().await.unwrap();

        assert!(cache.is_empty().await.unwrap());
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (cache, clock) = default_cache();
        cache
            .set_with("a", "1".to_string(), SetOptions::new().ttl(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.set("b", "2".to_string()).await.unwrap();

        clock.set(20);
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.keys().await.unwrap(), vec!["b".to_string()]);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_access_count_increases() {
        let backend = Arc::new(MemoryBackend::<String>::new());
        let cache: GenericCache<String> =
            GenericCache::with_backend(CacheOptions::default(), backend.clone()).unwrap();

        cache.set("k", "v".to_string()).await.unwrap();
        cache.get("k").await;
        cache.get("k").await;

        let entry = backend.get("k").await.unwrap().unwrap();
        assert_eq!(entry.access_count, 2);
    }

    #[tokio::test]
    async fn test_backend_failure_fails_open_on_read() {
        let backend = Arc::new(FlakyBackend::default());
        let cache: GenericCache<String> =
            GenericCache::with_backend(CacheOptions::default(), backend.clone()).unwrap();
        let (_sub, seen) = {
            let seen = Arc::new(StdMutex::new(Vec::new()));
            let sink = seen.clone();
            (cache.on_event(move |e: &CacheEvent| sink.lock().unwrap().push(e.clone())), seen)
        };

        cache.set("k", "v".to_string()).await.unwrap();
        backend.failing.store(true, Ordering::SeqCst);

        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().misses, 1);
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.event_type, CacheEventType::Error);
        assert_eq!(last.key.as_deref(), Some("k"));
        let data = last.data.unwrap();
        assert_eq!(data["operation"], "get");
        assert_eq!(data["backend"], true);
    }

    #[tokio::test]
    async fn test_backend_failure_fails_closed_on_write() {
        let backend = Arc::new(FlakyBackend::default());
        let cache: GenericCache<String> =
            GenericCache::with_backend(CacheOptions::default(), backend.clone()).unwrap();
        backend.failing.store(true, Ordering::SeqCst);

        let err = cache.set("k", "v".to_string()).await.unwrap_err();
        assert!(matches!(err, CacheError::BackendUnavailable(_)));
        assert!(cache.delete("k").await.is_err());
        assert!(cache.clear().await.is_err());

        backend.failing.store(false, Ordering::SeqCst);
        assert!(cache.get("k").await.is_none(), "failed write must not be visible");
    }

    #[tokio::test]
    async fn test_failed_write_evicts_nothing() {
        let backend = Arc::new(FlakyBackend::default());
        let options = CacheOptions::builder().max_items(1).build();
        let cache: GenericCache<String> =
            GenericCache::with_backend(options, backend.clone()).unwrap();
        cache.set("a", "kept".to_string()).await.unwrap();
        let (_sub, seen) = record_events(&cache);

        backend.failing_sets.store(true, Ordering::SeqCst);
        let err = cache.set("b", "new".to_string()).await.unwrap_err();
        assert!(matches!(err, CacheError::BackendUnavailable(_)));
        backend.failing_sets.store(false, Ordering::SeqCst);

        assert_eq!(cache.keys().await.unwrap(), vec!["a"]);
        assert_eq!(cache.stats().evictions, 0);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.event_type != CacheEventType::Evict));
    }

    #[tokio::test]
    async fn test_failed_eviction_rolls_back_write() {
        let backend = Arc::new(FlakyBackend::default());
        let options = CacheOptions::builder().max_items(2).build();
        let cache: GenericCache<String> =
            GenericCache::with_backend(options, backend.clone()).unwrap();
        cache.set("a", "one".to_string()).await.unwrap();
        cache.set("b", "two".to_string()).await.unwrap();
        cache.set("c", "three".to_string()).await.unwrap();
        assert_eq!(cache.keys().await.unwrap(), vec!["b", "c"]);

        // `d` is written, then evicting `b` for it fails
        *backend.undeletable.lock().unwrap() = Some("b".to_string());
        assert!(cache.set("d", "four".to_string()).await.is_err());
        *backend.undeletable.lock().unwrap() = None;

        assert_eq!(cache.keys().await.unwrap(), vec!["b", "c"]);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.get("b").await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_failed_eviction_restores_overwritten_value() {
        let backend = Arc::new(FlakyBackend::default());
        let options = CacheOptions::builder().max_size(20).build();
        let cache: GenericCache<String> =
            GenericCache::with_backend(options, backend.clone()).unwrap();
        cache.set("a", "old".to_string()).await.unwrap();
        cache.set("b", "other".to_string()).await.unwrap();

        // 16 bytes for the new `a` only fit once `b` (7 bytes) is gone
        *backend.undeletable.lock().unwrap() = Some("b".to_string());
        assert!(cache.set("a", "x".repeat(14)).await.is_err());
        *backend.undeletable.lock().unwrap() = None;

        assert_eq!(cache.keys().await.unwrap(), vec!["a", "b"]);
        assert_eq!(cache.get("a").await.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_unrecorded_refresh_claim_is_withdrawn() {
        let backend = Arc::new(FlakyBackend::default());
        let options = CacheOptions::builder()
            .ttl(Duration::from_millis(1_000))
            .stale_while_revalidate(true)
            .stale_time(Duration::from_millis(300))
            .build();
        let clock = ManualClock::new(0);
        let cache: GenericCache<String> = GenericCache::with_backend(options, backend.clone())
            .unwrap()
            .with_clock(clock.clone());
        cache.set("k", "old".to_string()).await.unwrap();
        let (_sub, seen) = record_events(&cache);

        clock.set(800);
        backend.failing_sets.store(true, Ordering::SeqCst);
        let hit = cache.lookup("k").await.unwrap();
        assert_eq!(hit.value, "old");
        assert!(!hit.should_revalidate);
        {
            let events = seen.lock().unwrap();
            assert_eq!(events[0].event_type, CacheEventType::Error);
            assert_eq!(events[0].data.as_ref().unwrap()["operation"], "touch");
            assert_eq!(events[1].event_type, CacheEventType::Hit);
            assert_eq!(events[1].data.as_ref().unwrap()["ttl_remaining"], 200);
        }

        backend.failing_sets.store(false, Ordering::SeqCst);
        assert!(cache.lookup("k").await.unwrap().should_revalidate);
        assert!(!cache.lookup("k").await.unwrap().should_revalidate);
    }

    #[tokio::test]
    async fn test_backend_timeout_is_failure() {
        let options = CacheOptions::builder()
            .backend_timeout(Duration::from_millis(20))
            .build();
        let cache: GenericCache<String> =
            GenericCache::with_backend(options, Arc::new(SlowBackend)).unwrap();

        assert!(cache.get("k").await.is_none());
        let err = cache.set("k", "v".to_string()).await.unwrap_err();
        assert!(matches!(err, CacheError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_listener_panic_does_not_abort_operation() {
        let (cache, _clock) = default_cache();
        let _bad = cache.on_event(|_| panic!("listener bug"));

        cache.set("k", "v".to_string()).await.unwrap();
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_returned_values_are_copies() {
        let (cache, _clock) = default_cache();
        cache.set("k", "v".to_string()).await.unwrap();

        let mut value = cache.get("k").await.unwrap();
        value.push_str("-mutated");

        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_persistent_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let options = CacheOptions::builder()
            .persistent(true)
            .storage_path(dir.path().join("cache.json"))
            .track_dependencies(true)
            .build();

        {
            let cache: GenericCache<String> = GenericCache::new(options.clone()).unwrap();
            cache.set("a", "1".to_string()).await.unwrap();
            cache
                .set_with("b", "2".to_string(), SetOptions::new().depends_on(["a"]))
                .await
                .unwrap();
        }

        let reopened: GenericCache<String> = GenericCache::new(options).unwrap();
        assert_eq!(reopened.get("a").await.as_deref(), Some("1"));

        // Dependencies are rebuilt from the stored entries
        let report = reopened.invalidate("a").await.unwrap();
        assert_eq!(report.removed, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let options = CacheOptions::builder().max_items(0).build();
        assert!(GenericCache::<String>::new(options).is_err());
    }
}
