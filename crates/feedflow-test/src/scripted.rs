//! Feeds driven step by step from a test
//!
//! Every step is recorded and replayed to late subscribers, so a test can
//! push values before the engine gets around to subscribing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedError, FeedId, FeedResult, FeedValue, Message, MessageEntry};
use feedflow_runtime::{Feed, FeedContext, FeedRef, MessageStream};

use crate::Jitter;

/// One scripted upstream event
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptStep<T> {
    Value(Option<T>),
    Transient(bool),
    Error(Option<FeedError>),
    /// Fail the subscription
    Fail(FeedError),
    /// End the subscription normally
    Complete,
}

struct ScriptedInner<T> {
    id: FeedId,
    history: Mutex<Script<T>>,
    subscriptions: AtomicUsize,
    jitter: Jitter,
}

struct Script<T> {
    steps: Vec<ScriptStep<T>>,
    subscribers: Vec<mpsc::UnboundedSender<ScriptStep<T>>>,
}

/// Push-driven test feed
pub struct ScriptedFeed<T> {
    inner: Arc<ScriptedInner<T>>,
}

impl<T> Clone for ScriptedFeed<T> {
    fn clone(&self) -> Self {
        ScriptedFeed {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: FeedValue> Default for ScriptedFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FeedValue> ScriptedFeed<T> {
    pub fn new() -> Self {
        Self::with_jitter(Jitter::none())
    }

    /// Every delivered step is delayed by a jitter sample
    pub fn with_jitter(jitter: Jitter) -> Self {
        ScriptedFeed {
            inner: Arc::new(ScriptedInner {
                id: FeedId::next(),
                history: Mutex::new(Script {
                    steps: Vec::new(),
                    subscribers: Vec::new(),
                }),
                subscriptions: AtomicUsize::new(0),
                jitter,
            }),
        }
    }

    pub fn id(&self) -> FeedId {
        self.inner.id
    }

    /// Record a step and deliver it to live subscribers
    pub fn push(&self, step: ScriptStep<T>) {
        let mut script = self.inner.history.lock();
        script
            .subscribers
            .retain(|subscriber| subscriber.unbounded_send(step.clone()).is_ok());
        script.steps.push(step);
    }

    pub fn emit(&self, value: T) {
        self.push(ScriptStep::Value(Some(value)));
    }

    pub fn set_transient(&self, is_transient: bool) {
        self.push(ScriptStep::Transient(is_transient));
    }

    pub fn fail(&self, error: FeedError) {
        self.push(ScriptStep::Fail(error));
    }

    pub fn complete(&self) {
        self.push(ScriptStep::Complete);
    }

    /// Subscriptions opened so far
    pub fn subscriptions(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    pub fn feed(&self) -> FeedRef<T> {
        Arc::new(self.clone())
    }
}

struct ScriptSubscription<T> {
    steps: mpsc::UnboundedReceiver<ScriptStep<T>>,
    previous: Option<Arc<MessageEntry<T>>>,
    inner: Arc<ScriptedInner<T>>,
    token: CancellationToken,
    done: bool,
}

impl<T: FeedValue> ScriptSubscription<T> {
    async fn next_message(&mut self) -> Option<FeedResult<Message<T>>> {
        while !self.done {
            let step = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                step = self.steps.next() => step?,
            };
            self.inner.jitter.pause().await;

            let base = self
                .previous
                .clone()
                .unwrap_or_else(|| Arc::new(MessageEntry::empty()));
            let entry = match step {
                ScriptStep::Value(data) => base.edit().data(data).build(),
                ScriptStep::Transient(is_transient) => base.edit().transient(is_transient).build(),
                ScriptStep::Error(error) => base.edit().error(error).build(),
                ScriptStep::Fail(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
                ScriptStep::Complete => {
                    self.done = true;
                    return None;
                }
            };

            let entry = Arc::new(entry);
            match self.previous.replace(Arc::clone(&entry)) {
                None => return Some(Ok(Message::first(entry))),
                Some(previous) => {
                    let message = Message::from_entries(previous, entry);
                    if !message.changes().is_empty() {
                        return Some(Ok(message));
                    }
                }
            }
        }
        None
    }
}

impl<T: FeedValue> Feed<T> for ScriptedFeed<T> {
    fn id(&self) -> FeedId {
        self.inner.id
    }

    fn subscribe(&self, _context: &FeedContext, token: CancellationToken) -> MessageStream<T> {
        let (sender, receiver) = mpsc::unbounded();
        {
            let mut script = self.inner.history.lock();
            for step in &script.steps {
                // The receiver is alive; a failed send cannot happen here.
                let _ = sender.unbounded_send(step.clone());
            }
            script.subscribers.push(sender);
        }
        self.inner.subscriptions.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(feed = %self.inner.id, "scripted feed subscribed");

        let subscription = ScriptSubscription {
            steps: receiver,
            previous: None,
            inner: Arc::clone(&self.inner),
            token,
            done: false,
        };
        stream::unfold(subscription, |mut subscription| async move {
            let item = subscription.next_message().await?;
            Some((item, subscription))
        })
        .boxed()
    }
}
