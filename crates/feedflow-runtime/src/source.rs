//! Source feeds backed by async work
//!
//! `AsyncFeed` runs a loader once per subscription. `StreamFeed` adapts a
//! stream of values; an `Err` item fails the subscription, which leaves
//! downstream owners serving the last value they saw.

use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedError, FeedId, FeedResult, FeedValue, Message, MessageEntry};

use crate::{Feed, FeedContext, FeedRef, MessageStream};

/// Loader invoked for every subscription
pub type Loader<T> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, FeedResult<Option<T>>> + Send + Sync>;

/// Feed of a single asynchronous load
///
/// Emits a transient message while loading, then one message with the
/// result (or the error on the `ERROR` axis) and completes.
pub struct AsyncFeed<T> {
    id: FeedId,
    loader: Loader<T>,
}

impl<T: FeedValue> AsyncFeed<T> {
    pub fn new<F, Fut>(loader: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FeedResult<Option<T>>> + Send + 'static,
    {
        AsyncFeed {
            id: FeedId::next(),
            loader: Arc::new(move |token| loader(token).boxed()),
        }
    }

    pub fn into_ref(self) -> FeedRef<T> {
        Arc::new(self)
    }
}

impl<T: FeedValue> Feed<T> for AsyncFeed<T> {
    fn id(&self) -> FeedId {
        self.id
    }

    fn subscribe(&self, _context: &FeedContext, token: CancellationToken) -> MessageStream<T> {
        let loading = Message::first(Arc::new(
            MessageEntry::empty().edit().transient(true).build(),
        ));
        let loader = Arc::clone(&self.loader);
        let feed = self.id;
        let previous = loading.clone();

        let result = async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                outcome = loader(token.clone()) => outcome,
            };
            let entry = match outcome {
                Ok(data) => MessageEntry::empty().edit().data(data).build(),
                Err(error) if error.is_cancellation() => return None,
                Err(error) => {
                    tracing::debug!(%feed, %error, "async load failed");
                    MessageEntry::empty().edit().error(Some(error)).build()
                }
            };
            Some(Ok(previous.next(entry)))
        };

        stream::once(future::ready(Ok(loading)))
            .chain(stream::once(result).filter_map(future::ready))
            .boxed()
    }
}

/// Factory producing a fresh value stream for every subscription
pub type StreamFactory<T> =
    Arc<dyn Fn() -> BoxStream<'static, FeedResult<Option<T>>> + Send + Sync>;

/// Feed over a stream of values
pub struct StreamFeed<T> {
    id: FeedId,
    factory: StreamFactory<T>,
}

impl<T: FeedValue> StreamFeed<T> {
    pub fn new<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: futures::Stream<Item = FeedResult<Option<T>>> + Send + 'static,
    {
        StreamFeed {
            id: FeedId::next(),
            factory: Arc::new(move || factory().boxed()),
        }
    }

    pub fn into_ref(self) -> FeedRef<T> {
        Arc::new(self)
    }
}

struct StreamState<T> {
    values: BoxStream<'static, FeedResult<Option<T>>>,
    previous: Option<Message<T>>,
    token: CancellationToken,
    failed: bool,
}

impl<T: FeedValue> StreamState<T> {
    async fn next_message(&mut self) -> Option<FeedResult<Message<T>>> {
        if self.failed {
            return None;
        }
        loop {
            let item = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                item = self.values.next() => item?,
            };
            let data = match item {
                Ok(data) => data,
                Err(error) => {
                    self.failed = true;
                    return Some(Err(error));
                }
            };

            let entry = MessageEntry::empty().edit().data(data).build();
            let message = match &self.previous {
                None => Message::first(Arc::new(entry)),
                Some(previous) => {
                    let message = previous.next(entry);
                    if message.changes().is_empty() {
                        continue;
                    }
                    message
                }
            };
            self.previous = Some(message.clone());
            return Some(Ok(message));
        }
    }
}

impl<T: FeedValue> Feed<T> for StreamFeed<T> {
    fn id(&self) -> FeedId {
        self.id
    }

    fn subscribe(&self, _context: &FeedContext, token: CancellationToken) -> MessageStream<T> {
        let state = StreamState {
            values: (self.factory)(),
            previous: None,
            token,
            failed: false,
        };
        stream::unfold(state, |mut state| async move {
            let item = state.next_message().await?;
            Some((item, state))
        })
        .boxed()
    }
}

/// Stream feed that fails right away
pub fn failing<T: FeedValue>(error: FeedError) -> StreamFeed<T> {
    StreamFeed::new(move || stream::iter([Err(error.clone())]))
}
