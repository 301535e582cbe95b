//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::cache::{Priority, SetOptions, MAX_KEY_LENGTH};

/// Request body for the SET operation (PUT /set)
///
/// # Fields
/// - `key`: The cache key to store the value under
/// - `value`: Any JSON value
/// - `ttl`: Optional TTL in milliseconds (uses the cache default if absent)
/// - `priority`: Optional eviction priority
/// - `dependencies`: Keys whose invalidation should also remove this one
/// - `normalize`: Store the normalized record list instead of the raw value
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub normalize: bool,
}

impl SetRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.key.is_empty() {
            return Some("Key cannot be empty".to_string());
        }
        if self.key.len() > MAX_KEY_LENGTH {
            return Some(format!(
                "Key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            ));
        }
        if self.ttl == Some(0) {
            return Some("TTL must be greater than zero".to_string());
        }
        if self.dependencies.iter().any(|d| d.is_empty()) {
            return Some("Dependency keys cannot be empty".to_string());
        }
        None
    }

    /// Per-write cache options carried by this request.
    pub fn set_options(&self) -> SetOptions {
        SetOptions {
            ttl: self.ttl.map(Duration::from_millis),
            priority: self.priority,
            dependencies: self.dependencies.clone(),
        }
    }
}
