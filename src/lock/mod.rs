//! Distributed mutual exclusion over the coordination store
//!
//! A lock is a single store record `key = fencing token` with a TTL, created
//! with an atomic set-if-absent. Release and extend are compare-and-delete
//! and compare-and-set-TTL against the caller's token, so a holder whose
//! lease lapsed can never remove or prolong the next holder's lock.

pub mod distributed;
pub mod types;

pub use distributed::DistributedLock;
pub use types::{FencingToken, LockConfig, LockHandle};
