//! Cache Events Module
//!
//! Typed cache events and a synchronous listener bus with scoped subscriptions.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::CacheError;

// == Event Type ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheEventType {
    Hit,
    Miss,
    Set,
    Delete,
    Clear,
    Expire,
    Evict,
    Error,
}

impl fmt::Display for CacheEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheEventType::Hit => "HIT",
            CacheEventType::Miss => "MISS",
            CacheEventType::Set => "SET",
            CacheEventType::Delete => "DELETE",
            CacheEventType::Clear => "CLEAR",
            CacheEventType::Expire => "EXPIRE",
            CacheEventType::Evict => "EVICT",
            CacheEventType::Error => "ERROR",
        };
        f.write_str(s)
    }
}

// == Cache Event ==
/// One observable cache operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    #[serde(rename = "type")]
    pub event_type: CacheEventType,
    /// Affected key; `None` for whole-cache operations such as CLEAR
    pub key: Option<String>,
    /// Unix milliseconds
    pub timestamp: u64,
    pub data: Option<Value>,
}

impl CacheEvent {
    pub fn new(event_type: CacheEventType, key: Option<&str>, timestamp: u64) -> Self {
        Self {
            event_type,
            key: key.map(str::to_string),
            timestamp,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

// == Event Bus ==
/// Delivers events to listeners synchronously, in emission order.
///
/// A panicking listener does not affect the others or the cache operation;
/// the panic is reported to the remaining listeners as an ERROR event.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
    namespace: String,
    debug: bool,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("namespace", &self.namespace)
            .field("listeners", &self.listener_count())
            .field("debug", &self.debug)
            .finish()
    }
}

impl EventBus {
    pub fn new(namespace: impl Into<String>, debug: bool) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            namespace: namespace.into(),
            debug,
        }
    }

    /// Registers a listener. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    // == Emit ==
    pub fn emit(&self, event: CacheEvent) {
        self.trace(&event);

        let failures = self.deliver(&event);
        for (listener_id, message) in failures {
            let err = CacheError::Listener(message.clone());
            warn!(
                namespace = %self.namespace,
                listener_id,
                event_type = %event.event_type,
                key = ?event.key,
                "{}", err
            );

            if event.event_type == CacheEventType::Error {
                continue;
            }

            let report = CacheEvent {
                event_type: CacheEventType::Error,
                key: event.key.clone(),
                timestamp: event.timestamp,
                data: Some(json!({
                    "source_event": event.event_type,
                    "listener_id": listener_id,
                    "message": message,
                })),
            };
            self.trace(&report);
            for (nested_id, nested) in self.deliver(&report) {
                warn!(
                    namespace = %self.namespace,
                    listener_id = nested_id,
                    "listener failed while handling ERROR event: {}",
                    nested
                );
            }
        }
    }

    fn deliver(&self, event: &CacheEvent) -> Vec<(u64, String)> {
        // Snapshot so listeners may subscribe or unsubscribe while running
        let listeners: Vec<(u64, Listener)> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .clone();

        listeners
            .into_iter()
            .filter_map(|(id, listener)| {
                catch_unwind(AssertUnwindSafe(|| listener(event)))
                    .err()
                    .map(|panic| (id, panic_message(panic.as_ref())))
            })
            .collect()
    }

    fn trace(&self, event: &CacheEvent) {
        if self.debug {
            debug!(
                target: "api_cache::events",
                namespace = %self.namespace,
                event_type = %event.event_type,
                key = ?event.key,
                timestamp = event.timestamp,
                data = ?event.data,
                "cache event"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

// == Subscription ==
/// Keeps a listener registered for as long as it lives.
#[must_use = "dropping a Subscription unregisters its listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    /// Unregisters the listener now.
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}
