//! Per-upstream dependency of a session
//!
//! A `FeedDependency` owns the subscription to one upstream feed. It keeps
//! the latest upstream message and, while an execution of the owner is
//! reading it, a pinned snapshot guarded by a `FastAsyncLock`. Upstream
//! messages are applied under the same lock, so a pinned snapshot never
//! changes underneath a running execution.
//!
//! After each upstream message the dependency decides between two outcomes:
//! - a changed axis was touched by the last execution: ask the session to
//!   re-run the owner;
//! - otherwise: forward the untyped message so the session can republish
//!   the upstream's progress, error and custom axes without running owner
//!   code.
//!
//! Axes the owner read are stripped from the forwarded message; the owner
//! derives those itself on its next execution.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use feedflow_core::{
    AxisSet, EntryId, ExecutionId, FeedError, FeedId, FeedResult, FeedValue, Message,
    MessageAxis, MessageInfo,
};
use feedflow_sync::{FastAsyncLock, FastAsyncLockGuard};

use crate::session::SessionSink;
use crate::{ExecuteRequest, FeedExecution, MessageStream};

/// Type-erased dependency, as stored in a session's index
pub(crate) trait DependencyHandle: Send + Sync {
    fn feed(&self) -> FeedId;

    /// Pin the dependency for `execution`
    fn on_executing<'a>(
        self: Arc<Self>,
        execution: &'a FeedExecution,
    ) -> BoxFuture<'a, FeedResult<()>>;

    /// Release the pin taken for `execution`, if any
    fn on_executed(&self, execution: ExecutionId);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Pin<T> {
    execution: ExecutionId,
    message: Message<T>,
    _guard: FastAsyncLockGuard,
}

struct DependencyState<T> {
    last: Option<Message<T>>,
    pin: Option<Pin<T>>,
    /// Axes read by the most recent pinned execution
    touched: AxisSet,
    /// Pinned entry -> execution, for touches reported by entry
    entries: HashMap<EntryId, ExecutionId>,
    /// Execution waiting for the first upstream value
    bootstrap: Option<FeedExecution>,
    failure: Option<FeedError>,
    completed: bool,
}

impl<T> DependencyState<T> {
    fn is_pinned_for(&self, execution: ExecutionId) -> bool {
        self.pin
            .as_ref()
            .map_or(false, |pin| pin.execution == execution)
    }

    fn pin(&mut self, execution: ExecutionId, message: Message<T>, guard: FastAsyncLockGuard) {
        self.touched.clear();
        self.entries.insert(message.current().id(), execution);
        self.pin = Some(Pin {
            execution,
            message,
            _guard: guard,
        });
    }

    /// Error for a read of an upstream that will never produce a value
    fn unavailable(&self, feed: FeedId) -> Option<FeedError> {
        if self.completed && self.last.is_none() {
            Some(
                self.failure
                    .clone()
                    .unwrap_or(FeedError::SourceCompleted(feed)),
            )
        } else {
            None
        }
    }
}

/// Outcome of applying one upstream message
struct Applied {
    info: MessageInfo,
    reload: Option<ExecuteRequest>,
}

/// Dependency of an owner session on one upstream feed
pub struct FeedDependency<T> {
    feed: FeedId,
    session: Weak<dyn SessionSink>,
    lock: FastAsyncLock,
    token: CancellationToken,
    /// Signalled on the first upstream value and on completion
    ready: Notify,
    state: Mutex<DependencyState<T>>,
}

impl<T: FeedValue> FeedDependency<T> {
    pub(crate) fn new(
        feed: FeedId,
        session: Weak<dyn SessionSink>,
        token: CancellationToken,
        bootstrap: FeedExecution,
    ) -> Arc<Self> {
        Arc::new(FeedDependency {
            feed,
            session,
            lock: FastAsyncLock::new(),
            token,
            ready: Notify::new(),
            state: Mutex::new(DependencyState {
                last: None,
                pin: None,
                touched: AxisSet::new(),
                entries: HashMap::new(),
                bootstrap: Some(bootstrap),
                failure: None,
                completed: false,
            }),
        })
    }

    #[inline]
    pub fn feed(&self) -> FeedId {
        self.feed
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Execution currently holding the pin
    pub fn pinned_execution(&self) -> Option<ExecutionId> {
        self.state.lock().pin.as_ref().map(|pin| pin.execution)
    }

    /// Latest upstream message, pinned or not
    pub fn last_message(&self) -> Option<Message<T>> {
        self.state.lock().last.clone()
    }

    /// Axes that will trigger a reload when they change
    pub fn touched(&self) -> AxisSet {
        self.state.lock().touched.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Error that ended the upstream subscription
    pub fn failure(&self) -> Option<FeedError> {
        self.state.lock().failure.clone()
    }

    /// Pin the current upstream message for `execution`
    ///
    /// Waits for the first upstream value. A completed upstream is never
    /// pinned: readers get its last value, or its failure if it never
    /// produced one.
    pub(crate) async fn on_executing(self: Arc<Self>, execution: &FeedExecution) -> FeedResult<()> {
        {
            let mut state = self.state.lock();
            if state.is_pinned_for(execution.id()) {
                return Ok(());
            }
            if let Some(error) = state.unavailable(self.feed) {
                return Err(error);
            }
            if state.completed {
                return Ok(());
            }
            if state.last.is_none() {
                state.bootstrap = Some(execution.clone());
            }
        }

        self.wait_ready(execution.token()).await?;

        {
            let state = self.state.lock();
            // The first value may have been pinned for us already
            if state.is_pinned_for(execution.id()) {
                return Ok(());
            }
            if let Some(error) = state.unavailable(self.feed) {
                return Err(error);
            }
            if state.completed {
                return Ok(());
            }
        }

        let guard = self.lock.lock(execution.token()).await?;
        let mut state = self.state.lock();
        let Some(last) = state.last.clone() else {
            return Err(FeedError::SourceCompleted(self.feed));
        };
        if !execution.track_pin(Arc::clone(&self) as Arc<dyn DependencyHandle>) {
            return Err(FeedError::Cancelled);
        }
        state.pin(execution.id(), last, guard);
        tracing::trace!(feed = %self.feed, execution = %execution.id(), "dependency pinned");
        Ok(())
    }

    async fn wait_ready(&self, token: &CancellationToken) -> FeedResult<()> {
        loop {
            let notified = self.ready.notified();
            {
                let state = self.state.lock();
                if state.last.is_some() || state.completed {
                    return Ok(());
                }
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FeedError::Cancelled),
                _ = notified => {}
            }
        }
    }

    /// Message `execution` should read
    pub fn get_current_message(&self, execution: ExecutionId) -> Message<T> {
        let state = self.state.lock();
        match &state.pin {
            Some(pin) if pin.execution == execution => pin.message.clone(),
            _ => state.last.clone().unwrap_or_else(Message::initial),
        }
    }

    /// Record a read of `axis`; ignored unless pinned for `execution`
    pub fn notify_touched(&self, execution: ExecutionId, axis: MessageAxis) {
        let mut state = self.state.lock();
        if state.is_pinned_for(execution) {
            state.touched.insert(axis);
        }
    }

    /// Record a read of `axis` on the entry a reader was handed
    pub fn notify_touched_entry(&self, entry: EntryId, axis: MessageAxis) {
        let mut state = self.state.lock();
        if let Some(execution) = state.entries.get(&entry).copied() {
            if state.is_pinned_for(execution) {
                state.touched.insert(axis);
            }
        }
    }

    /// Release the pin held for `execution`
    pub(crate) fn on_executed(&self, execution: ExecutionId) {
        let released = {
            let mut state = self.state.lock();
            if !state.is_pinned_for(execution) {
                return;
            }
            let pin = state.pin.take();
            if let Some(pin) = &pin {
                let entry = pin.message.current().id();
                if state.entries.get(&entry) == Some(&execution) {
                    state.entries.remove(&entry);
                }
            }
            pin
        };
        // Guard dropped outside the state mutex
        drop(released);
        tracing::trace!(feed = %self.feed, %execution, "dependency released");
    }

    /// Upstream subscription loop
    pub(crate) async fn run(self: Arc<Self>, mut upstream: MessageStream<T>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = upstream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(error)) if error.is_cancellation() => break,
                Some(Err(error)) => {
                    tracing::warn!(
                        feed = %self.feed,
                        %error,
                        "upstream subscription failed, serving last value"
                    );
                    self.state.lock().failure = Some(error);
                    break;
                }
                None => {
                    tracing::debug!(feed = %self.feed, "upstream completed");
                    break;
                }
            };

            let guard = match self.lock.lock(&self.token).await {
                Ok(guard) => guard,
                Err(_) => break,
            };
            let applied = self.apply(message, guard);

            let Some(session) = self.session.upgrade() else {
                break;
            };
            session.update_parent(self.feed, applied.info);
            if let Some(request) = applied.reload {
                tracing::debug!(feed = %self.feed, reason = %request.reason, "requesting reload");
                session.execute(request);
            }
        }

        self.complete();
    }

    fn apply(self: &Arc<Self>, message: Message<T>, guard: FastAsyncLockGuard) -> Applied {
        let info = message.info();
        let mut state = self.state.lock();
        let first = state.last.is_none();
        state.last = Some(message.clone());

        if first {
            if let Some(execution) = state.bootstrap.take() {
                if state.pin.is_none()
                    && !execution.is_cancelled()
                    && execution.track_pin(Arc::clone(self) as Arc<dyn DependencyHandle>)
                {
                    tracing::trace!(
                        feed = %self.feed,
                        execution = %execution.id(),
                        "first value pinned for waiting execution"
                    );
                    state.pin(execution.id(), message, guard);
                }
            }
            drop(state);
            self.ready.notify_waiters();
            return Applied { info, reload: None };
        }

        let reload = info
            .changes
            .first_common(&state.touched)
            .map(|axis| ExecuteRequest::reload(self.feed, axis));
        Applied {
            info: forwarded(info, &state.touched),
            reload,
        }
    }

    fn complete(&self) {
        {
            let mut state = self.state.lock();
            state.completed = true;
            state.bootstrap = None;
        }
        self.ready.notify_waiters();
        if let Some(session) = self.session.upgrade() {
            session.unregister_dependency(self.feed);
        }
    }
}

/// Drop the axes the owner reads from an untyped upstream message
fn forwarded(mut info: MessageInfo, touched: &AxisSet) -> MessageInfo {
    if touched.contains(MessageAxis::ERROR) {
        info.error = None;
    }
    info.custom.retain(|(axis, _)| !touched.contains(*axis));
    info
}

impl<T: FeedValue> DependencyHandle for FeedDependency<T> {
    fn feed(&self) -> FeedId {
        self.feed
    }

    fn on_executing<'a>(
        self: Arc<Self>,
        execution: &'a FeedExecution,
    ) -> BoxFuture<'a, FeedResult<()>> {
        FeedDependency::<T>::on_executing(self, execution).boxed()
    }

    fn on_executed(&self, execution: ExecutionId) {
        FeedDependency::<T>::on_executed(self, execution)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T> fmt::Debug for FeedDependency<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedDependency")
            .field("feed", &self.feed)
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}
