//! Mutable source feed
//!
//! `State<T>` holds the latest entry in a `watch` channel. Writers edit it in
//! place; every subscriber diffs what it sees against what it saw last, so
//! coalesced updates still produce a correct change set.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedError, FeedId, FeedValue, Message, MessageBuilder, MessageEntry};

use crate::{Feed, FeedContext, FeedRef, MessageStream};

struct StateInner<T> {
    id: FeedId,
    current: watch::Sender<Arc<MessageEntry<T>>>,
}

/// Writable feed
pub struct State<T> {
    inner: Arc<StateInner<T>>,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        State {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: FeedValue> Default for State<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FeedValue> State<T> {
    /// Empty state: no data, no error
    pub fn new() -> Self {
        Self::from_entry(MessageEntry::empty())
    }

    pub fn with_value(value: T) -> Self {
        Self::from_entry(MessageEntry::of(value))
    }

    fn from_entry(entry: MessageEntry<T>) -> Self {
        let (current, _) = watch::channel(Arc::new(entry));
        State {
            inner: Arc::new(StateInner {
                id: FeedId::next(),
                current,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> FeedId {
        self.inner.id
    }

    /// Latest entry
    pub fn current(&self) -> Arc<MessageEntry<T>> {
        Arc::clone(&self.inner.current.borrow())
    }

    pub fn value(&self) -> Option<T> {
        self.inner.current.borrow().data().cloned()
    }

    /// Replace the data axis; returns whether anything changed
    pub fn update(&self, f: impl FnOnce(Option<&T>) -> Option<T>) -> bool {
        self.update_message(|builder| {
            let next = f(builder.current_data());
            builder.data(next)
        })
    }

    pub fn set(&self, value: Option<T>) -> bool {
        self.update_message(|builder| builder.data(value))
    }

    pub fn set_transient(&self, is_transient: bool) -> bool {
        self.update_message(|builder| builder.transient(is_transient))
    }

    pub fn set_error(&self, error: Option<FeedError>) -> bool {
        self.update_message(|builder| builder.error(error))
    }

    /// Edit the whole entry; subscribers are only woken on a real change
    pub fn update_message(&self, f: impl FnOnce(MessageBuilder<T>) -> MessageBuilder<T>) -> bool {
        self.inner.current.send_if_modified(|entry| {
            let next = f(entry.edit()).build();
            if entry.diff(&next).is_empty() {
                return false;
            }
            *entry = Arc::new(next);
            true
        })
    }

    /// This state as a subscribable feed
    pub fn feed(&self) -> FeedRef<T> {
        Arc::new(self.clone())
    }
}

impl<T: FeedValue> Feed<T> for State<T> {
    fn id(&self) -> FeedId {
        self.inner.id
    }

    fn subscribe(&self, _context: &FeedContext, token: CancellationToken) -> MessageStream<T> {
        let subscription = Subscription {
            receiver: self.inner.current.subscribe(),
            previous: None,
            token,
        };
        stream::unfold(subscription, |mut subscription| async move {
            let message = subscription.next_message().await?;
            Some((Ok(message), subscription))
        })
        .boxed()
    }
}

struct Subscription<T> {
    receiver: watch::Receiver<Arc<MessageEntry<T>>>,
    previous: Option<Arc<MessageEntry<T>>>,
    token: CancellationToken,
}

impl<T: FeedValue> Subscription<T> {
    async fn next_message(&mut self) -> Option<Message<T>> {
        loop {
            if self.previous.is_some() {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return None,
                    changed = self.receiver.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
            } else if self.token.is_cancelled() {
                return None;
            }

            let entry = Arc::clone(&*self.receiver.borrow_and_update());
            match self.previous.replace(Arc::clone(&entry)) {
                None => return Some(Message::first(entry)),
                Some(previous) => {
                    let message = Message::from_entries(previous, entry);
                    // A write that was undone before we looked is not a change.
                    if !message.changes().is_empty() {
                        return Some(message);
                    }
                }
            }
        }
    }
}
