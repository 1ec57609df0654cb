//! Feed sessions
//!
//! A session is one consumer's subscription to an owner feed. It owns the
//! dependency index, schedules executions of the owner body and publishes
//! the owner's messages. Only the most recent execution may publish; older
//! ones are cancelled and their results dropped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};

use feedflow_core::{
    ExecutionId, FeedError, FeedId, FeedResult, FeedValue, Message, MessageEntry, MessageInfo,
    SessionId,
};

use crate::dependency::{DependencyHandle, FeedDependency};
use crate::{ExecuteRequest, FeedContext, FeedExecution, FeedRef, SessionConfig};

/// Owner body run by every execution
pub type ExecutionBody<T> =
    Arc<dyn Fn(FeedExecution) -> BoxFuture<'static, FeedResult<Option<T>>> + Send + Sync>;

/// Callbacks from dependencies into their session
pub(crate) trait SessionSink: Send + Sync {
    /// Schedule a new execution, superseding the running one
    fn execute(&self, request: ExecuteRequest);

    /// Untouched axes of an upstream message, republished by the owner
    fn update_parent(&self, feed: FeedId, info: MessageInfo);

    /// The upstream of `feed` completed or failed
    fn unregister_dependency(&self, feed: FeedId);
}

#[derive(Default)]
struct DependencyIndex {
    all: HashMap<FeedId, Arc<dyn DependencyHandle>>,
    /// Dependencies still subscribed, in registration order
    active: Vec<FeedId>,
}

impl DependencyIndex {
    fn register(&mut self, feed: FeedId, dependency: Arc<dyn DependencyHandle>) {
        self.all.insert(feed, dependency);
        self.active.push(feed);
    }

    fn unregister(&mut self, feed: FeedId) -> bool {
        let before = self.active.len();
        self.active.retain(|id| *id != feed);
        self.active.len() != before
    }
}

/// Untyped half of a session, shared with executions
pub(crate) struct SessionCore {
    id: SessionId,
    owner: FeedId,
    context: FeedContext,
    token: CancellationToken,
    sink: Weak<dyn SessionSink>,
    dependencies: Mutex<DependencyIndex>,
}

impl SessionCore {
    pub(crate) fn new(
        owner: FeedId,
        context: FeedContext,
        token: CancellationToken,
        sink: Weak<dyn SessionSink>,
    ) -> Arc<Self> {
        Arc::new(SessionCore {
            id: SessionId::next(),
            owner,
            context,
            token,
            sink,
            dependencies: Mutex::new(DependencyIndex::default()),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub(crate) fn owner(&self) -> FeedId {
        self.owner
    }

    #[inline]
    pub(crate) fn config(&self) -> &SessionConfig {
        self.context.config()
    }

    /// Existing dependency on `feed`, or a new one discovered by `execution`
    pub(crate) fn dependency<U: FeedValue>(
        &self,
        feed: &FeedRef<U>,
        execution: &FeedExecution,
    ) -> FeedResult<Arc<FeedDependency<U>>> {
        let id = feed.id();
        let mut index = self.dependencies.lock();
        if let Some(existing) = index.all.get(&id) {
            return Arc::clone(existing)
                .into_any()
                .downcast::<FeedDependency<U>>()
                .map_err(|_| FeedError::DependencyTypeMismatch(id));
        }

        let dependency = FeedDependency::new(
            id,
            self.sink.clone(),
            self.token.child_token(),
            execution.clone(),
        );
        index.register(id, Arc::clone(&dependency) as Arc<dyn DependencyHandle>);
        drop(index);

        tracing::debug!(
            session = %self.id,
            owner = %self.owner,
            feed = %id,
            execution = %execution.id(),
            "dependency registered"
        );
        let upstream = feed.subscribe(&self.context, dependency.token().clone());
        tokio::spawn(Arc::clone(&dependency).run(upstream));
        Ok(dependency)
    }

    pub(crate) fn unregister_dependency(&self, feed: FeedId) -> bool {
        self.dependencies.lock().unregister(feed)
    }

    pub(crate) fn active_dependencies(&self) -> Vec<Arc<dyn DependencyHandle>> {
        let index = self.dependencies.lock();
        index
            .active
            .iter()
            .filter_map(|feed| index.all.get(feed).cloned())
            .collect()
    }

    fn dependency_ids(&self) -> Vec<FeedId> {
        let index = self.dependencies.lock();
        let mut ids: Vec<FeedId> = index.all.keys().copied().collect();
        ids.sort();
        ids
    }

    fn active_ids(&self) -> Vec<FeedId> {
        self.dependencies.lock().active.clone()
    }
}

struct CurrentExecution {
    id: ExecutionId,
    token: CancellationToken,
}

/// What the owner publishes, and who is allowed to change it
struct OwnerState<T> {
    current: Option<CurrentExecution>,
    last: Option<Message<T>>,
    data: Option<T>,
    error: Option<FeedError>,
    reloading: bool,
    /// Last forwarded message of each dependency
    upstream: BTreeMap<FeedId, MessageInfo>,
}

impl<T> Default for OwnerState<T> {
    fn default() -> Self {
        OwnerState {
            current: None,
            last: None,
            data: None,
            error: None,
            reloading: false,
            upstream: BTreeMap::new(),
        }
    }
}

impl<T: FeedValue> OwnerState<T> {
    /// Owner entry: the execution result plus forwarded upstream axes
    ///
    /// The owner's own error wins over forwarded ones. For custom axes the
    /// upstream with the lowest feed id wins.
    fn entry(&self, config: &SessionConfig) -> MessageEntry<T> {
        let transient = (config.transient_on_reload && self.reloading)
            || (config.forward_dependency_progress
                && self.upstream.values().any(|info| info.is_transient));
        let error = self
            .error
            .clone()
            .or_else(|| self.upstream.values().find_map(|info| info.error.clone()));

        let mut builder = MessageEntry::empty()
            .edit()
            .data(self.data.clone())
            .error(error)
            .transient(transient);
        for info in self.upstream.values().rev() {
            for (axis, value) in &info.custom {
                builder = builder.axis(*axis, Some(value.clone()));
            }
        }
        builder.build()
    }
}

struct SessionInner<T> {
    core: Arc<SessionCore>,
    this: Weak<SessionInner<T>>,
    body: ExecutionBody<T>,
    output: mpsc::UnboundedSender<FeedResult<Message<T>>>,
    next_execution: AtomicU64,
    state: Mutex<OwnerState<T>>,
}

impl<T: FeedValue> SessionInner<T> {
    fn start(&self, request: ExecuteRequest) {
        if self.core.token.is_cancelled() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let id = ExecutionId::new(self.next_execution.fetch_add(1, Ordering::Relaxed));
        let token = self.core.token.child_token();
        tracing::debug!(
            session = %self.core.id,
            owner = %self.core.owner,
            execution = %id,
            reason = %request.reason,
            "execution scheduled"
        );
        let execution = FeedExecution::new(id, Arc::clone(&self.core), token.clone(), request);

        {
            let mut state = self.state.lock();
            if let Some(previous) = state.current.replace(CurrentExecution { id, token }) {
                tracing::trace!(session = %self.core.id, superseded = %previous.id, "execution superseded");
                previous.token.cancel();
            }
            if state.last.is_some() {
                state.reloading = true;
                self.publish(&mut state);
            }
        }

        tokio::spawn(this.run(execution));
    }

    async fn run(self: Arc<Self>, execution: FeedExecution) {
        let outcome = tokio::select! {
            biased;
            _ = execution.token().cancelled() => None,
            outcome = self.run_body(&execution) => Some(outcome),
        };

        for dependency in execution.finish() {
            dependency.on_executed(execution.id());
        }

        match outcome {
            Some(outcome) => self.complete(execution.id(), outcome),
            None => tracing::trace!(
                session = %self.core.id,
                execution = %execution.id(),
                "execution cancelled"
            ),
        }
    }

    async fn run_body(&self, execution: &FeedExecution) -> FeedResult<Option<T>> {
        for dependency in self.core.active_dependencies() {
            let feed = dependency.feed();
            if let Err(error) = dependency.on_executing(execution).await {
                tracing::debug!(execution = %execution.id(), %feed, %error, "pin failed");
                return Err(error);
            }
        }
        (self.body)(execution.clone()).await
    }

    fn complete(&self, id: ExecutionId, outcome: FeedResult<Option<T>>) {
        let mut state = self.state.lock();
        if state.current.as_ref().map(|current| current.id) != Some(id) {
            tracing::trace!(session = %self.core.id, execution = %id, "stale result dropped");
            return;
        }
        state.current = None;
        state.reloading = false;

        match outcome {
            Ok(data) => {
                state.data = data;
                state.error = None;
            }
            Err(error) => {
                tracing::debug!(
                    session = %self.core.id,
                    owner = %self.core.owner,
                    execution = %id,
                    %error,
                    "execution failed"
                );
                state.error = Some(error);
            }
        }
        self.publish(&mut state);
    }

    /// Send the owner entry if it differs from the last one sent
    fn publish(&self, state: &mut OwnerState<T>) {
        let entry = state.entry(self.core.config());
        let message = match &state.last {
            None => Message::first(Arc::new(entry)),
            Some(last) => {
                let message = last.next(entry);
                if message.changes().is_empty() {
                    return;
                }
                message
            }
        };
        tracing::trace!(session = %self.core.id, changes = ?message.changes(), "publishing");
        state.last = Some(message.clone());
        // A closed channel means the consumer is gone; cancellation follows.
        let _ = self.output.unbounded_send(Ok(message));
    }
}

impl<T: FeedValue> SessionSink for SessionInner<T> {
    fn execute(&self, request: ExecuteRequest) {
        self.start(request);
    }

    fn update_parent(&self, feed: FeedId, info: MessageInfo) {
        let mut state = self.state.lock();
        state.upstream.insert(feed, info);
        if state.last.is_some() {
            self.publish(&mut state);
        }
    }

    fn unregister_dependency(&self, feed: FeedId) {
        if self.core.unregister_dependency(feed) {
            tracing::debug!(session = %self.core.id, feed = %feed, "dependency unregistered");
        }
        // A finished upstream keeps its last error and custom axes
        let mut state = self.state.lock();
        let settled = match state.upstream.get_mut(&feed) {
            Some(info) if info.is_transient => {
                info.is_transient = false;
                true
            }
            _ => false,
        };
        if settled && state.last.is_some() {
            self.publish(&mut state);
        }
    }
}

/// Handle on a running session
pub struct FeedSession<T> {
    inner: Arc<SessionInner<T>>,
}

impl<T> Clone for FeedSession<T> {
    fn clone(&self) -> Self {
        FeedSession {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: FeedValue> FeedSession<T> {
    /// Start a session for `owner` and run its first execution
    ///
    /// The session lives as long as the returned stream; dropping it or
    /// cancelling `token` tears down executions and upstream subscriptions.
    pub fn start(
        owner: FeedId,
        context: FeedContext,
        token: CancellationToken,
        body: ExecutionBody<T>,
    ) -> SessionStream<T> {
        let token = token.child_token();
        let (output, receiver) = mpsc::unbounded();

        let inner = Arc::new_cyclic(|this: &Weak<SessionInner<T>>| {
            let sink: Weak<dyn SessionSink> = this.clone();
            SessionInner {
                core: SessionCore::new(owner, context, token.clone(), sink),
                this: this.clone(),
                body,
                output,
                next_execution: AtomicU64::new(1),
                state: Mutex::new(OwnerState::default()),
            }
        });

        // End the stream once the session is cancelled from above
        {
            let inner = Arc::downgrade(&inner);
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                if let Some(inner) = inner.upgrade() {
                    inner.output.close_channel();
                }
            });
        }

        tracing::debug!(session = %inner.core.id, owner = %owner, "session started");
        let session = FeedSession { inner };
        session.execute(ExecuteRequest::initial());

        SessionStream {
            receiver,
            session,
            _cancel: token.drop_guard(),
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.inner.core.id
    }

    #[inline]
    pub fn owner(&self) -> FeedId {
        self.inner.core.owner
    }

    /// Schedule a new execution of the owner
    pub fn execute(&self, request: ExecuteRequest) {
        self.inner.start(request);
    }

    pub fn cancel(&self) {
        self.inner.core.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.core.token.is_cancelled()
    }

    /// Every upstream ever read, sorted by id
    pub fn dependencies(&self) -> Vec<FeedId> {
        self.inner.core.dependency_ids()
    }

    /// Upstreams still subscribed, in discovery order
    pub fn active_dependencies(&self) -> Vec<FeedId> {
        self.inner.core.active_ids()
    }

    pub fn current_execution(&self) -> Option<ExecutionId> {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .map(|current| current.id)
    }

    /// Last message published to the consumer
    pub fn last_message(&self) -> Option<Message<T>> {
        self.inner.state.lock().last.clone()
    }
}

impl<T> fmt::Debug for FeedSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSession")
            .field("id", &self.inner.core.id)
            .field("owner", &self.inner.core.owner)
            .finish()
    }
}

/// Owner messages of a session; dropping it ends the session
pub struct SessionStream<T> {
    receiver: mpsc::UnboundedReceiver<FeedResult<Message<T>>>,
    session: FeedSession<T>,
    _cancel: DropGuard,
}

impl<T> SessionStream<T> {
    pub fn session(&self) -> &FeedSession<T> {
        &self.session
    }
}

impl<T> Stream for SessionStream<T> {
    type Item = FeedResult<Message<T>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DerivedFeed, State};
    use feedflow_core::{AxisSet, AxisValue, MessageAxis};
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn next<S: Stream<Item = FeedResult<Message<u32>>> + Unpin>(stream: &mut S) -> Message<u32> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("stream failed")
    }

    fn body<F>(f: F) -> ExecutionBody<u32>
    where
        F: Fn(FeedExecution) -> BoxFuture<'static, FeedResult<Option<u32>>> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[tokio::test]
    async fn test_first_message_after_first_execution() {
        let mut stream = FeedSession::start(
            FeedId::next(),
            FeedContext::default(),
            CancellationToken::new(),
            body(|_| async { Ok(Some(5)) }.boxed()),
        );

        let first = next(&mut stream).await;
        assert_eq!(first.current().data(), Some(&5));
        assert_eq!(first.changes(), &AxisSet::from([MessageAxis::DATA]));
    }

    #[tokio::test]
    async fn test_error_keeps_previous_data() {
        let source = State::with_value(1u32);
        let feed = source.feed();
        let mut stream = FeedSession::start(
            FeedId::next(),
            FeedContext::default(),
            CancellationToken::new(),
            body(move |execution| {
                let feed = Arc::clone(&feed);
                async move {
                    match execution.data(&feed).await? {
                        Some(0) => Err(FeedError::execution("zero")),
                        other => Ok(other),
                    }
                }
                .boxed()
            }),
        );
        assert_eq!(next(&mut stream).await.current().data(), Some(&1));

        source.set(Some(0));
        let failed = next(&mut stream).await;
        assert_eq!(failed.changes(), &AxisSet::from([MessageAxis::ERROR]));
        assert_eq!(failed.current().data(), Some(&1));

        source.set(Some(4));
        let recovered = next(&mut stream).await;
        assert_eq!(recovered.current().data(), Some(&4));
        assert!(recovered.current().error().is_none());
    }

    #[tokio::test]
    async fn test_superseded_execution_is_not_surfaced() {
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut stream = {
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            FeedSession::start(
                FeedId::next(),
                FeedContext::default(),
                CancellationToken::new(),
                body(move |execution| {
                    let gate = Arc::clone(&gate);
                    let run = runs.fetch_add(1, Ordering::SeqCst) as u32;
                    async move {
                        if execution.request().reason == "slow" {
                            gate.notified().await;
                        }
                        Ok(Some(run))
                    }
                    .boxed()
                }),
            )
        };
        assert_eq!(next(&mut stream).await.current().data(), Some(&0));

        stream.session().execute(ExecuteRequest::new("slow"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.session().execute(ExecuteRequest::new("fast"));

        assert_eq!(next(&mut stream).await.current().data(), Some(&2));
        gate.notify_waiters();

        let nothing = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(nothing.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_on_reload() {
        let gate = Arc::new(Notify::new());
        let mut stream = {
            let gate = Arc::clone(&gate);
            FeedSession::start(
                FeedId::next(),
                FeedContext::new(SessionConfig::verbose()),
                CancellationToken::new(),
                body(move |execution| {
                    let gate = Arc::clone(&gate);
                    async move {
                        if execution.request().reason == "refresh" {
                            gate.notified().await;
                            return Ok(Some(2));
                        }
                        Ok(Some(1))
                    }
                    .boxed()
                }),
            )
        };
        assert_eq!(next(&mut stream).await.current().data(), Some(&1));

        stream.session().execute(ExecuteRequest::new("refresh"));
        let loading = next(&mut stream).await;
        assert_eq!(loading.changes(), &AxisSet::from([MessageAxis::PROGRESS]));
        assert!(loading.current().is_transient());
        assert_eq!(loading.current().data(), Some(&1));

        gate.notify_one();
        let loaded = next(&mut stream).await;
        assert_eq!(loaded.current().data(), Some(&2));
        assert!(!loaded.current().is_transient());
    }

    #[tokio::test]
    async fn test_dependencies_are_indexed() {
        let a = State::with_value(1u32);
        let b = State::with_value(2u32);
        let owner = DerivedFeed::new({
            let (a, b) = (a.feed(), b.feed());
            move |execution: FeedExecution| {
                let (a, b) = (Arc::clone(&a), Arc::clone(&b));
                async move {
                    let a = execution.data(&a).await?.unwrap_or_default();
                    let b = execution.data(&b).await?.unwrap_or_default();
                    Ok(Some(a + b))
                }
            }
        });

        let mut stream = FeedSession::start(
            owner.id(),
            FeedContext::default(),
            CancellationToken::new(),
            owner.body(),
        );
        assert_eq!(next(&mut stream).await.current().data(), Some(&3));

        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(stream.session().dependencies(), expected);
        assert_eq!(stream.session().active_dependencies(), vec![a.id(), b.id()]);
        assert!(stream.session().current_execution().is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_session() {
        let stream = FeedSession::start(
            FeedId::next(),
            FeedContext::default(),
            CancellationToken::new(),
            body(|_| async { Ok(Some(1)) }.boxed()),
        );
        let session = stream.session().clone();
        assert!(!session.is_cancelled());

        drop(stream);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancellation_ends_stream() {
        let token = CancellationToken::new();
        let mut stream = FeedSession::start(
            FeedId::next(),
            FeedContext::default(),
            token.clone(),
            body(|_| async { Ok(Some(1)) }.boxed()),
        );
        next(&mut stream).await;

        token.cancel();
        let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn test_owner_entry_progress() {
        let mut state = OwnerState::<u32>::default();
        state.data = Some(1);
        let loading = Message::<u32>::initial().update(|b| b.transient(true));
        state.upstream.insert(FeedId::new(1), loading.info());
        assert!(state.entry(&SessionConfig::default()).is_transient());
        assert!(!state.entry(&SessionConfig::quiet()).is_transient());

        state.upstream.insert(FeedId::new(1), Message::<u32>::initial().info());
        state.reloading = true;
        assert!(!state.entry(&SessionConfig::default()).is_transient());
        assert!(state.entry(&SessionConfig::verbose()).is_transient());
    }

    #[test]
    fn test_owner_entry_forwarded_axes() {
        let cursor = MessageAxis::register("EntryCursor");
        let low = AxisValue::new(1u32);
        let high = AxisValue::new(2u32);

        let mut state = OwnerState::<u32>::default();
        state.data = Some(1);
        let failed = Message::<u32>::initial().update(|b| {
            b.error(Some(FeedError::execution("upstream")))
                .axis(cursor, Some(high.clone()))
        });
        state.upstream.insert(FeedId::new(9), failed.info());
        let tagged = Message::<u32>::initial().update(|b| b.axis(cursor, Some(low.clone())));
        state.upstream.insert(FeedId::new(2), tagged.info());

        let entry = state.entry(&SessionConfig::default());
        assert_eq!(entry.error(), Some(&FeedError::ExecutionFailed("upstream".into())));
        assert!(entry.axis_value(cursor).unwrap().same(&low));
        assert_eq!(entry.data(), Some(&1));

        state.error = Some(FeedError::execution("own"));
        let entry = state.entry(&SessionConfig::default());
        assert_eq!(entry.error(), Some(&FeedError::ExecutionFailed("own".into())));
    }
}
