//! feedflow Operations - Concurrency policies for asynchronous user actions
//!
//! Imperative actions ("save", "load more", ...) are submitted to an
//! operations manager whose policy decides how overlapping submissions are
//! handled:
//! - Queue: sequential, FIFO
//! - AbortPrevious: last wins, the running operation is cancelled
//! - IgnoreNew: first wins, submissions while busy are dropped
//! - Parallel: unbounded fan-out
//!
//! All managers follow the observer grammar: `on_next*` then at most one of
//! `on_error` / `on_completed`, with calls not overlapping each other.
//! Operations are spawned on the ambient tokio runtime.

pub mod config;
pub mod manager;
pub mod sequential;
pub mod last_wins;
pub mod first_wins;
pub mod parallel;

pub use config::*;
pub use manager::*;
pub use sequential::*;
pub use last_wins::*;
pub use first_wins::*;
pub use parallel::*;
