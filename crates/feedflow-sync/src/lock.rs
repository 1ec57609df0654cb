//! FIFO async lock
//!
//! A plain mutex cannot be held across a suspension point, but a feed
//! dependency must stay pinned for a whole owner recomputation, which
//! suspends many times. `FastAsyncLock` hands out an owned guard that can
//! live across `.await`s; contending callers suspend (never block a thread)
//! and are served in arrival order.
//!
//! Preconditions: the lock is not reentrant, and the guard must be dropped
//! for the lock to be released. Leaking a guard starves every later caller.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedError, FeedResult};

/// Waiting acquisition
struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    /// Owned either by an outstanding guard or by a granted waiter
    locked: bool,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

struct LockInner {
    state: Mutex<LockState>,
}

impl LockInner {
    /// Pass ownership to the oldest waiter, or free the lock.
    ///
    /// Ownership is transferred under the state mutex whether or not the
    /// waiter is still listening; an abandoned waiter releases it again
    /// from its drop path.
    fn release(&self) {
        let mut state = self.state.lock();
        match state.waiters.pop_front() {
            Some(waiter) => {
                let _ = waiter.grant.send(());
            }
            None => state.locked = false,
        }
    }
}

/// Async-aware, non-reentrant, FIFO-fair mutual exclusion
#[derive(Clone)]
pub struct FastAsyncLock {
    inner: Arc<LockInner>,
}

impl FastAsyncLock {
    pub fn new() -> Self {
        FastAsyncLock {
            inner: Arc::new(LockInner {
                state: Mutex::new(LockState::default()),
            }),
        }
    }

    /// Acquire the lock, suspending until it is free
    ///
    /// Cancelling `token` while waiting removes this caller from the queue
    /// and returns `FeedError::Cancelled`; the current holder is not
    /// affected.
    pub async fn lock(&self, token: &CancellationToken) -> FeedResult<FastAsyncLockGuard> {
        let (ticket, granted) = {
            let mut state = self.inner.state.lock();
            if !state.locked {
                state.locked = true;
                return Ok(self.guard());
            }
            if token.is_cancelled() {
                return Err(FeedError::Cancelled);
            }

            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (grant, granted) = oneshot::channel();
            state.waiters.push_back(Waiter { ticket, grant });
            tracing::trace!(ticket, waiters = state.waiters.len(), "lock contended");
            (ticket, granted)
        };

        let mut pending = PendingAcquire {
            inner: Arc::clone(&self.inner),
            ticket,
            settled: false,
        };

        let acquired = tokio::select! {
            biased;
            grant = granted => grant.is_ok(),
            _ = token.cancelled() => false,
        };

        if acquired {
            pending.settled = true;
            Ok(self.guard())
        } else {
            // `pending` drops here: dequeues the waiter, or hands on a grant
            // that raced with the cancellation.
            Err(FeedError::Cancelled)
        }
    }

    /// Acquire the lock only if it is free right now
    pub fn try_lock(&self) -> Option<FastAsyncLockGuard> {
        let mut state = self.inner.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(self.guard())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().locked
    }

    /// Number of suspended acquisitions
    pub fn waiters(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    fn guard(&self) -> FastAsyncLockGuard {
        FastAsyncLockGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for FastAsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FastAsyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FastAsyncLock")
            .field("locked", &state.locked)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// In-flight acquisition; cleans up if the acquiring future is abandoned
struct PendingAcquire {
    inner: Arc<LockInner>,
    ticket: u64,
    settled: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let mut state = self.inner.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.ticket == self.ticket) {
            state.waiters.remove(pos);
            return;
        }
        drop(state);

        // Already granted: ownership is ours, pass it on.
        self.inner.release();
    }
}

/// Exclusive access token; dropping it releases the lock
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct FastAsyncLockGuard {
    inner: Arc<LockInner>,
}

impl Drop for FastAsyncLockGuard {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl fmt::Debug for FastAsyncLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FastAsyncLockGuard")
    }
}
