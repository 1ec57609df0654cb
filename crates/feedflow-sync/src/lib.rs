//! feedflow Sync - Async-aware synchronization primitives
//!
//! This crate provides:
//! - `FastAsyncLock`: a non-reentrant, FIFO-fair mutual exclusion primitive
//!   whose guard can be held across suspension points

pub mod lock;

pub use lock::*;
