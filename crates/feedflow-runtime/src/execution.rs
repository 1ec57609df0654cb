//! One run of an owner's body
//!
//! A `FeedExecution` is the handle the body reads its upstreams through.
//! Every read pins the upstream for the lifetime of the execution, so the
//! body sees one consistent snapshot, and records which axes were touched so
//! the session only re-runs when one of those changes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use feedflow_core::{
    AxisValue, ExecutionId, FeedError, FeedId, FeedResult, FeedValue, Message, MessageAxis,
    SessionId,
};

use crate::dependency::{DependencyHandle, FeedDependency};
use crate::session::SessionCore;
use crate::FeedRef;

/// Why an execution was started
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub reason: String,
    /// Upstream whose change caused the request
    pub source: Option<FeedId>,
}

impl ExecuteRequest {
    pub fn new(reason: impl Into<String>) -> Self {
        ExecuteRequest {
            reason: reason.into(),
            source: None,
        }
    }

    /// First run of a session
    pub fn initial() -> Self {
        Self::new("initial execution")
    }

    /// A touched axis of `feed` changed
    pub fn reload(feed: FeedId, axis: MessageAxis) -> Self {
        ExecuteRequest {
            reason: format!("axis {} of {} changed", axis, feed),
            source: Some(feed),
        }
    }
}

/// Pins taken by an execution; closed once the execution finished
#[derive(Default)]
struct PinRegistry {
    completed: bool,
    pinned: Vec<Arc<dyn DependencyHandle>>,
}

struct ExecutionInner {
    id: ExecutionId,
    session: Arc<SessionCore>,
    token: CancellationToken,
    request: ExecuteRequest,
    pins: Mutex<PinRegistry>,
}

/// Handle passed to an owner body
#[derive(Clone)]
pub struct FeedExecution {
    inner: Arc<ExecutionInner>,
}

impl FeedExecution {
    pub(crate) fn new(
        id: ExecutionId,
        session: Arc<SessionCore>,
        token: CancellationToken,
        request: ExecuteRequest,
    ) -> Self {
        FeedExecution {
            inner: Arc::new(ExecutionInner {
                id,
                session,
                token,
                request,
                pins: Mutex::new(PinRegistry::default()),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> ExecutionId {
        self.inner.id
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.inner.session.id()
    }

    #[inline]
    pub fn owner(&self) -> FeedId {
        self.inner.session.owner()
    }

    /// Cancelled when a newer execution supersedes this one
    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    #[inline]
    pub fn request(&self) -> &ExecuteRequest {
        &self.inner.request
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Read an upstream feed
    ///
    /// The first read of a feed in the session subscribes to it. The returned
    /// view is pinned until this execution finishes.
    pub async fn get<U: FeedValue>(&self, feed: &FeedRef<U>) -> FeedResult<Tracked<U>> {
        if self.is_cancelled() {
            return Err(FeedError::Cancelled);
        }

        let dependency = self.inner.session.dependency(feed, self)?;
        Arc::clone(&dependency).on_executing(self).await?;
        let message = dependency.get_current_message(self.id());
        Ok(Tracked {
            dependency,
            message,
        })
    }

    /// Read the data axis of an upstream feed
    pub async fn data<U: FeedValue>(&self, feed: &FeedRef<U>) -> FeedResult<Option<U>> {
        Ok(self.get(feed).await?.data().cloned())
    }

    /// Record a pin; refused once the execution has finished
    pub(crate) fn track_pin(&self, dependency: Arc<dyn DependencyHandle>) -> bool {
        let mut pins = self.inner.pins.lock();
        if pins.completed {
            return false;
        }
        pins.pinned.push(dependency);
        true
    }

    /// Close the registry and hand back every pin taken
    pub(crate) fn finish(&self) -> Vec<Arc<dyn DependencyHandle>> {
        let mut pins = self.inner.pins.lock();
        pins.completed = true;
        std::mem::take(&mut pins.pinned)
    }
}

impl fmt::Debug for FeedExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedExecution")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.session.owner())
            .field("reason", &self.inner.request.reason)
            .finish()
    }
}

/// Pinned view of an upstream message
///
/// Accessors record the axis they read, which makes a later change of that
/// axis re-run the owner.
pub struct Tracked<T> {
    dependency: Arc<FeedDependency<T>>,
    message: Message<T>,
}

impl<T: FeedValue> Tracked<T> {
    #[inline]
    pub fn feed(&self) -> FeedId {
        self.dependency.feed()
    }

    pub fn data(&self) -> Option<&T> {
        self.touch(MessageAxis::DATA);
        self.message.current().data()
    }

    pub fn error(&self) -> Option<&FeedError> {
        self.touch(MessageAxis::ERROR);
        self.message.current().error()
    }

    pub fn is_transient(&self) -> bool {
        self.touch(MessageAxis::PROGRESS);
        self.message.current().is_transient()
    }

    pub fn axis_value(&self, axis: MessageAxis) -> Option<&AxisValue> {
        self.touch(axis);
        self.message.current().axis_value(axis)
    }

    /// Mark an axis as read without reading it
    pub fn touch(&self, axis: MessageAxis) {
        self.dependency
            .notify_touched_entry(self.message.current().id(), axis);
    }

    /// The pinned message; reading it this way is not tracked
    pub fn untracked(&self) -> &Message<T> {
        &self.message
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("message", &self.message)
            .finish()
    }
}
