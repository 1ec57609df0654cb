//! feedflow Runtime - Feed graph execution
//!
//! This crate implements the dependency-tracking machinery:
//! - The `Feed` contract and its explicit `FeedContext`
//! - Source feeds (`State`, `AsyncFeed`, `StreamFeed`)
//! - Derived feeds driven by a `FeedExecution`
//! - Feed sessions, executions and per-upstream dependencies
//! - Selective invalidation: an owner re-runs only when an axis it read changed
//! - Session configuration and tracing bootstrap

pub mod config;
pub mod logging;
pub mod feed;
pub mod state;
pub mod source;
pub mod execution;
pub mod dependency;
pub mod session;
pub mod derived;

pub use config::*;
pub use logging::*;
pub use feed::*;
pub use state::*;
pub use source::*;
pub use execution::*;
pub use dependency::*;
pub use session::*;
pub use derived::*;
