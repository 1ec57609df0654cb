//! feedflow Test Harness - Scenario checks for feed graphs
//!
//! This crate provides:
//! - Probes (gates, event logs) to observe async code from tests
//! - Seeded jitter to shake out interleavings
//! - Scripted feeds driven step by step from a test
//! - End-to-end scenarios for pinning, upstream failure and operation managers

pub mod probe;
pub mod jitter;
pub mod scripted;
pub mod scenario;

pub use probe::*;
pub use jitter::*;
pub use scripted::*;
pub use scenario::*;
