//! Feeds computed from other feeds

use std::future::Future;
use std::sync::Arc;

use futures::future::{self, FutureExt};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedId, FeedResult, FeedValue};

use crate::{ExecutionBody, Feed, FeedContext, FeedExecution, FeedRef, FeedSession, MessageStream};

/// Owner feed whose value is produced by an async body
///
/// Each subscription starts its own session. The body reads upstreams
/// through the `FeedExecution` it is given and is re-run only when an axis
/// it read changes.
pub struct DerivedFeed<T> {
    id: FeedId,
    body: ExecutionBody<T>,
}

impl<T: FeedValue> DerivedFeed<T> {
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(FeedExecution) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FeedResult<Option<T>>> + Send + 'static,
    {
        DerivedFeed {
            id: FeedId::next(),
            body: Arc::new(move |execution| body(execution).boxed()),
        }
    }

    /// Projection of a single upstream
    ///
    /// An upstream error is propagated as the owner's error.
    pub fn select<U, F>(upstream: FeedRef<U>, f: F) -> Self
    where
        U: FeedValue,
        F: Fn(&U) -> Option<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |execution: FeedExecution| {
            let upstream = Arc::clone(&upstream);
            let f = Arc::clone(&f);
            async move {
                let tracked = execution.get(&upstream).await?;
                if let Some(error) = tracked.error() {
                    return Err(error.clone());
                }
                Ok(tracked.data().and_then(|value| f(value)))
            }
        })
    }

    #[inline]
    pub fn id(&self) -> FeedId {
        self.id
    }

    pub fn body(&self) -> ExecutionBody<T> {
        Arc::clone(&self.body)
    }

    pub fn into_ref(self) -> FeedRef<T> {
        Arc::new(self)
    }
}

impl<T: FeedValue> Feed<T> for DerivedFeed<T> {
    fn id(&self) -> FeedId {
        self.id
    }

    fn subscribe(&self, context: &FeedContext, token: CancellationToken) -> MessageStream<T> {
        match context.enter(self.id) {
            Ok(context) => FeedSession::start(self.id, context, token, self.body()).boxed(),
            Err(error) => {
                tracing::warn!(feed = %self.id, %error, "subscription refused");
                stream::once(future::ready(Err(error))).boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use feedflow_core::{AxisSet, AxisValue, FeedError, Message, MessageAxis};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;

    async fn next(stream: &mut MessageStream<u32>) -> Message<u32> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("stream failed")
    }

    async fn quiet(stream: &mut MessageStream<u32>) -> bool {
        tokio::time::timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err()
    }

    fn counted(upstream: FeedRef<u32>, runs: &Arc<AtomicUsize>) -> FeedRef<u32> {
        let runs = Arc::clone(runs);
        DerivedFeed::select(upstream, move |value: &u32| {
            runs.fetch_add(1, Ordering::SeqCst);
            Some(value * 10)
        })
        .into_ref()
    }

    #[tokio::test]
    async fn test_progress_change_is_forwarded_without_reexecution() {
        let source = State::with_value(1u32);
        let runs = Arc::new(AtomicUsize::new(0));
        let derived = counted(source.feed(), &runs);
        let mut stream = derived.subscribe(&FeedContext::default(), CancellationToken::new());

        let first = next(&mut stream).await;
        assert_eq!(first.current().data(), Some(&10));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        source.set_transient(true);
        let loading = next(&mut stream).await;
        assert_eq!(loading.changes(), &AxisSet::from([MessageAxis::PROGRESS]));
        assert!(loading.current().is_transient());
        assert_eq!(loading.current().data(), Some(&10));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        source.set(Some(2));
        let reloaded = next(&mut stream).await;
        assert_eq!(reloaded.changes(), &AxisSet::from([MessageAxis::DATA]));
        assert_eq!(reloaded.current().data(), Some(&20));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        source.set_transient(false);
        let settled = next(&mut stream).await;
        assert_eq!(settled.changes(), &AxisSet::from([MessageAxis::PROGRESS]));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    fn reads_data_only(upstream: FeedRef<u32>, runs: &Arc<AtomicUsize>) -> FeedRef<u32> {
        let runs = Arc::clone(runs);
        DerivedFeed::new(move |execution: FeedExecution| {
            let upstream = Arc::clone(&upstream);
            runs.fetch_add(1, Ordering::SeqCst);
            async move { execution.data(&upstream).await }
        })
        .into_ref()
    }

    #[tokio::test]
    async fn test_untouched_error_is_forwarded_without_reexecution() {
        let source = State::with_value(1u32);
        let runs = Arc::new(AtomicUsize::new(0));
        let derived = reads_data_only(source.feed(), &runs);
        let mut stream = derived.subscribe(&FeedContext::default(), CancellationToken::new());
        assert_eq!(next(&mut stream).await.current().data(), Some(&1));

        source.set_error(Some(FeedError::execution("stale")));
        let failed = next(&mut stream).await;
        assert_eq!(failed.changes(), &AxisSet::from([MessageAxis::ERROR]));
        assert_eq!(
            failed.current().error(),
            Some(&FeedError::ExecutionFailed("stale".into()))
        );
        assert_eq!(failed.current().data(), Some(&1));

        source.set_error(None);
        let cleared = next(&mut stream).await;
        assert_eq!(cleared.changes(), &AxisSet::from([MessageAxis::ERROR]));
        assert!(cleared.current().error().is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_untouched_custom_axis_is_forwarded_without_reexecution() {
        let cursor = MessageAxis::register("ForwardedCursor");
        let source = State::with_value(1u32);
        let runs = Arc::new(AtomicUsize::new(0));
        let derived = reads_data_only(source.feed(), &runs);
        let mut stream = derived.subscribe(&FeedContext::default(), CancellationToken::new());
        next(&mut stream).await;

        let token = AxisValue::new("page-2");
        source.update_message(|b| b.axis(cursor, Some(token.clone())));
        let paged = next(&mut stream).await;
        assert_eq!(paged.changes(), &AxisSet::from([cursor]));
        assert!(paged.current().axis_value(cursor).unwrap().same(&token));
        assert_eq!(paged.current().data(), Some(&1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_touched_custom_axis_reloads() {
        let cursor = MessageAxis::register("ReloadCursor");
        let source = State::with_value(1u32);
        let runs = Arc::new(AtomicUsize::new(0));
        let derived = {
            let upstream = source.feed();
            let runs = Arc::clone(&runs);
            DerivedFeed::new(move |execution: FeedExecution| {
                let upstream = Arc::clone(&upstream);
                runs.fetch_add(1, Ordering::SeqCst);
                async move {
                    let tracked = execution.get(&upstream).await?;
                    let paged = tracked.axis_value(cursor).is_some();
                    Ok(tracked.data().map(|v| if paged { v * 100 } else { *v }))
                }
            })
            .into_ref()
        };
        let mut stream = derived.subscribe(&FeedContext::default(), CancellationToken::new());
        assert_eq!(next(&mut stream).await.current().data(), Some(&1));

        source.update_message(|b| b.axis(cursor, Some(AxisValue::new(2u32))));
        let reloaded = next(&mut stream).await;
        assert_eq!(reloaded.changes(), &AxisSet::from([MessageAxis::DATA]));
        assert_eq!(reloaded.current().data(), Some(&100));
        assert!(reloaded.current().axis_value(cursor).is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_quiet_config_does_not_forward_progress() {
        let source = State::with_value(1u32);
        let runs = Arc::new(AtomicUsize::new(0));
        let derived = counted(source.feed(), &runs);
        let context = FeedContext::new(crate::SessionConfig::quiet());
        let mut stream = derived.subscribe(&context, CancellationToken::new());
        next(&mut stream).await;

        source.set_transient(true);
        assert!(quiet(&mut stream).await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chained_derivation() {
        let source = State::with_value(2u32);
        let doubled = DerivedFeed::select(source.feed(), |v: &u32| Some(v * 2)).into_ref();
        let plus_one = DerivedFeed::select(doubled, |v: &u32| Some(v + 1)).into_ref();
        let mut stream = plus_one.subscribe(&FeedContext::default(), CancellationToken::new());

        assert_eq!(next(&mut stream).await.current().data(), Some(&5));
        source.set(Some(10));
        assert_eq!(next(&mut stream).await.current().data(), Some(&21));
    }

    #[tokio::test]
    async fn test_upstream_error_is_propagated() {
        let source = State::with_value(3u32);
        let derived = DerivedFeed::select(source.feed(), |v: &u32| Some(*v)).into_ref();
        let mut stream = derived.subscribe(&FeedContext::default(), CancellationToken::new());
        next(&mut stream).await;

        source.set_error(Some(FeedError::execution("stale")));
        let failed = next(&mut stream).await;
        assert_eq!(failed.changes(), &AxisSet::from([MessageAxis::ERROR]));
        assert_eq!(failed.current().data(), Some(&3));
    }

    #[tokio::test]
    async fn test_cycle_fails_fast() {
        let slot: Arc<OnceLock<FeedRef<u32>>> = Arc::new(OnceLock::new());
        let b = {
            let slot = Arc::clone(&slot);
            DerivedFeed::new(move |execution: FeedExecution| {
                let a = slot.get().cloned();
                async move {
                    let a = a.ok_or_else(|| FeedError::execution("unbound"))?;
                    execution.data(&a).await
                }
            })
            .into_ref()
        };
        let a = DerivedFeed::select(Arc::clone(&b), |v: &u32| Some(v + 1)).into_ref();
        assert!(slot.set(Arc::clone(&a)).is_ok());

        let mut stream = a.subscribe(&FeedContext::default(), CancellationToken::new());
        let first = next(&mut stream).await;
        assert!(matches!(
            first.current().error(),
            Some(FeedError::CycleDetected(_))
        ));
        assert!(first.current().data().is_none());
    }

    #[tokio::test]
    async fn test_self_subscription_is_refused() {
        let derived = DerivedFeed::<u32>::new(|_| async { Ok(Some(1)) });
        let context = FeedContext::default().enter(derived.id()).unwrap();
        let mut stream = derived.subscribe(&context, CancellationToken::new());

        let refused = stream.next().await.unwrap();
        assert!(matches!(refused, Err(FeedError::CycleDetected(_))));
        assert!(stream.next().await.is_none());
    }
}
