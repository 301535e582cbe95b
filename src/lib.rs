//! API Cache - a client-side response cache
//!
//! Pluggable storage, TTL expiry, stale-while-revalidate, policy-driven
//! eviction and dependency-aware invalidation, with an optional HTTP facade.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheOptions, GenericCache, SetOptions};
pub use config::Config;
pub use error::{CacheError, Result};
pub use models::normalize_response;
pub use tasks::spawn_cleanup_task;
