//! Rate limiting module
//!
//! This module provides distributed rate limiting backed by the coordination
//! store, using one of three algorithms:
//!
//! - **Fixed Window**: one counter per window; simple, but admits up to twice
//!   the limit across a window boundary
//! - **Sliding Window Log**: exact, storage proportional to the limit
//! - **Token Bucket**: smooth rate limiting with burst support and bounded storage
//!
//! # Features
//!
//! - One atomic store round-trip per check, no sleeping
//! - Configurable behavior when the store is down (propagate, fail open,
//!   fail closed, or a per-process fallback limiter)
//!
//! # Example
//!
//! ```rust,no_run
//! use gatekeeper::rate_limit::{RateLimitConfig, RateLimiter};
//! use gatekeeper::store::InMemoryStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::new(
//!         Arc::new(InMemoryStore::new()),
//!         RateLimitConfig::token_bucket(5, 1.0),
//!     )
//!     .unwrap();
//!
//!     let decision = limiter
//!         .allow("user:123", &CancellationToken::new())
//!         .await
//!         .unwrap();
//!     if !decision.allowed {
//!         println!("retry after {:?}", decision.retry_after);
//!     }
//! }
//! ```

pub mod limiter;
pub mod local;
pub mod types;

// Re-export commonly used types
pub use limiter::RateLimiter;
pub use local::LocalFallback;
pub use types::{RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, StoreFailurePolicy};
