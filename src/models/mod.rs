//! Request and Response models for the cache server API
//!
//! DTOs for HTTP bodies, plus the normalization applied to upstream
//! responses before they are cached.

pub mod normalize;
pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use normalize::normalize_response;
pub use requests::SetRequest;
pub use responses::{
    ClearResponse, DeleteResponse, ErrorResponse, GetResponse, HealthResponse, InvalidateResponse,
    KeysResponse, SetResponse, StatsResponse,
};
