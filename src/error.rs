//! Error types for the response cache
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache and its HTTP facade.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The storage backend could not be reached or timed out
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Eviction could not free enough room for the new entry
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// An entry could not be encoded or decoded by the backend
    #[error("Serialization failed for '{key}': {message}")]
    Serialization { key: String, message: String },

    /// The dependency graph contains a cycle through the listed keys
    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// An event listener panicked while handling an event
    #[error("Listener failed: {0}")]
    Listener(String),

    /// Invalid request data or cache options
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Returns true for faults a read may recover from by reporting a miss.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            CacheError::BackendUnavailable(_) | CacheError::Serialization { .. }
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization {
            key: String::new(),
            message: err.to_string(),
        }
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::CapacityExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
            CacheError::BackendUnavailable(_) | CacheError::Serialization { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CacheError::DependencyCycle(_) | CacheError::Listener(_) | CacheError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
