//! The feed contract
//!
//! A feed is anything that can be subscribed to and yields a stream of
//! versioned messages. Subscriptions are driven by the consumer: dropping the
//! stream or cancelling the token ends it. An `Err` item is terminal.

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedError, FeedId, FeedResult, FeedValue, Message};

use crate::SessionConfig;

/// Stream produced by a subscription
pub type MessageStream<T> = BoxStream<'static, FeedResult<Message<T>>>;

/// Subscribable source of messages
pub trait Feed<T: FeedValue>: Send + Sync + 'static {
    /// Stable identity, used to deduplicate dependencies
    fn id(&self) -> FeedId;

    /// Start a subscription
    ///
    /// The first message is diffed against `Message::initial()`; every later
    /// message carries a non-empty change set.
    fn subscribe(&self, context: &FeedContext, token: CancellationToken) -> MessageStream<T>;
}

/// Shared handle to a feed
pub type FeedRef<T> = Arc<dyn Feed<T>>;

/// Explicit subscription context
///
/// Carries the session configuration and the chain of owners currently
/// being subscribed, which is how dependency cycles are caught.
#[derive(Clone, Default)]
pub struct FeedContext {
    config: SessionConfig,
    path: Arc<Vec<FeedId>>,
}

impl FeedContext {
    pub fn new(config: SessionConfig) -> Self {
        FeedContext {
            config,
            path: Arc::new(Vec::new()),
        }
    }

    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Owners from the outermost subscriber inwards
    #[inline]
    pub fn path(&self) -> &[FeedId] {
        &self.path
    }

    /// Context for the session of `owner`
    pub fn enter(&self, owner: FeedId) -> FeedResult<FeedContext> {
        if self.path.contains(&owner) {
            let chain = self
                .path
                .iter()
                .chain(std::iter::once(&owner))
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(FeedError::CycleDetected(chain));
        }

        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.extend_from_slice(&self.path);
        path.push(owner);
        Ok(FeedContext {
            config: self.config.clone(),
            path: Arc::new(path),
        })
    }
}

impl fmt::Debug for FeedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedContext")
            .field("config", &self.config)
            .field("depth", &self.path.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_extends_path() {
        let root = FeedContext::default();
        let a = FeedId::new(1);
        let b = FeedId::new(2);

        let inner = root.enter(a).unwrap().enter(b).unwrap();
        assert_eq!(inner.path(), &[a, b]);
        assert!(root.path().is_empty());
    }

    #[test]
    fn test_enter_detects_cycle() {
        let a = FeedId::new(1);
        let b = FeedId::new(2);
        let context = FeedContext::default().enter(a).unwrap().enter(b).unwrap();

        match context.enter(a) {
            Err(FeedError::CycleDetected(chain)) => {
                assert_eq!(chain, "feed#1 -> feed#2 -> feed#1");
            }
            other => panic!("expected cycle, got {:?}", other.map(|c| c.path().to_vec())),
        }
    }

    #[test]
    fn test_config_is_inherited() {
        let context = FeedContext::new(SessionConfig::quiet());
        let inner = context.enter(FeedId::new(7)).unwrap();
        assert_eq!(inner.config(), &SessionConfig::quiet());
    }
}
