//! Middleware for observability and rate limiting.
//!
//! This module provides:
//! - Request logging with latency tracking
//! - Rate limiting per IP address
//! - API key enforcement for write endpoints

pub mod api_key;
pub mod logging;
pub mod rate_limit;

pub use api_key::require_api_key;
pub use logging::{request_logging, request_logging_simple};
pub use rate_limit::{RateLimitConfig, RateLimitLayer};
