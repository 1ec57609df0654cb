//! Identity types for feedflow
//!
//! All identifiers are 64-bit counters allocated from process-wide
//! sequences. They are cheap to copy, hash and compare, and are never reused
//! within a process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FEED: AtomicU64 = AtomicU64::new(1);
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);
static NEXT_ENTRY: AtomicU64 = AtomicU64::new(1);

/// Feed identity - distinguishes upstream feeds inside a session's dependency index
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FeedId(pub u64);

impl FeedId {
    pub const ZERO: FeedId = FeedId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        FeedId(id)
    }

    /// Allocate a fresh, process-unique feed identity
    pub fn next() -> Self {
        FeedId(NEXT_FEED.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Feed({})", self.0)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed#{}", self.0)
    }
}

/// Session identity - one consumer subscription to an owner feed
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const ZERO: SessionId = SessionId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }

    /// Allocate a fresh, process-unique session identity
    pub fn next() -> Self {
        SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Execution identity - one recomputation attempt within a session
///
/// Allocated by the owning session, so ids are only ordered within one
/// session: a larger id is always a newer execution.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ExecutionId(pub u64);

impl ExecutionId {
    pub const ZERO: ExecutionId = ExecutionId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        ExecutionId(id)
    }
}

impl fmt::Debug for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Execution({})", self.0)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec#{}", self.0)
    }
}

/// Message entry identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryId(pub u64);

impl EntryId {
    pub const ZERO: EntryId = EntryId(0);

    /// Allocate a fresh, process-unique entry identity
    pub fn next() -> Self {
        EntryId(NEXT_ENTRY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entry({})", self.0)
    }
}
