//! feedflow Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every other feedflow crate:
//! - Identifiers (FeedId, SessionId, ExecutionId, EntryId)
//! - Message axes and axis sets
//! - Versioned messages and their entries
//! - The error taxonomy

pub mod id;
pub mod axis;
pub mod message;
pub mod error;

pub use id::*;
pub use axis::*;
pub use message::*;
pub use error::*;
