//! AbortPrevious policy: a new submission cancels the running one

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedError, FeedResult};

use crate::manager::{run_operation, ManagerCore};
use crate::{AsyncOperation, AsyncOperationsManager, ConcurrencyMode};

struct LastWinsInner {
    core: ManagerCore,
    /// Token of the most recent operation
    current: Mutex<Option<CancellationToken>>,
    /// One for the upstream plus one per operation still running
    pending: AtomicUsize,
}

impl LastWinsInner {
    fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.core.drained();
        }
    }

    fn complete(&self) {
        if self.core.mark_completed() {
            self.release();
        }
    }
}

/// Last-wins operations manager
///
/// Superseded operations observe cancellation on their own token; that
/// cancellation is swallowed and never faults the manager.
pub struct LastWinsOperationsManager {
    inner: Arc<LastWinsInner>,
}

impl LastWinsOperationsManager {
    pub fn new(silent_errors: bool) -> Self {
        LastWinsOperationsManager {
            inner: Arc::new(LastWinsInner {
                core: ManagerCore::new(ConcurrencyMode::AbortPrevious, silent_errors),
                current: Mutex::new(None),
                pending: AtomicUsize::new(1),
            }),
        }
    }
}

impl AsyncOperationsManager for LastWinsOperationsManager {
    fn mode(&self) -> ConcurrencyMode {
        self.inner.core.mode()
    }

    fn on_next(&self, operation: AsyncOperation) -> FeedResult<()> {
        self.inner.core.check_accepting()?;

        let token = self.inner.core.child_token();
        let previous = self.inner.current.lock().replace(token.clone());
        if let Some(previous) = previous {
            tracing::trace!("superseding running operation");
            previous.cancel();
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_operation(&inner.core, operation, token).await;
            inner.release();
        });
        Ok(())
    }

    fn on_error(&self, error: FeedError) {
        if self.inner.core.report_failure(error) {
            self.inner.complete();
        }
    }

    fn on_completed(&self) {
        self.inner.complete();
    }

    fn dispose(&self) {
        self.inner.core.dispose();
    }

    fn completion(&self) -> BoxFuture<'static, FeedResult<()>> {
        self.inner.core.completion()
    }
}

impl Drop for LastWinsOperationsManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_new_submission_cancels_previous() {
        let manager = LastWinsOperationsManager::new(false);
        let a_token = Arc::new(Mutex::new(None::<CancellationToken>));
        let a_started = Arc::new(Notify::new());
        let b_ran = Arc::new(AtomicBool::new(false));

        {
            let a_token = Arc::clone(&a_token);
            let a_started = Arc::clone(&a_started);
            manager
                .on_next(operation(move |token| async move {
                    *a_token.lock() = Some(token.clone());
                    a_started.notify_one();
                    token.cancelled().await;
                    Err(FeedError::Cancelled)
                }))
                .unwrap();
        }
        a_started.notified().await;

        {
            let b_ran = Arc::clone(&b_ran);
            manager
                .on_next(operation(move |_| async move {
                    b_ran.store(true, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        manager.on_completed();

        assert_eq!(manager.completion().await, Ok(()));
        assert!(b_ran.load(Ordering::SeqCst));
        let a_token = a_token.lock().clone().unwrap();
        assert!(a_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_only_latest_outcome_faults() {
        let manager = LastWinsOperationsManager::new(false);
        let a_started = Arc::new(Notify::new());

        {
            let a_started = Arc::clone(&a_started);
            manager
                .on_next(operation(move |token| async move {
                    a_started.notify_one();
                    token.cancelled().await;
                    Err(FeedError::Cancelled)
                }))
                .unwrap();
        }
        a_started.notified().await;

        manager
            .on_next(operation(|_| async { Err(FeedError::operation("B failed")) }))
            .unwrap();

        assert_eq!(
            manager.completion().await,
            Err(FeedError::OperationFailed("B failed".into()))
        );
    }

    #[tokio::test]
    async fn test_external_cancellation_is_a_failure() {
        let manager = LastWinsOperationsManager::new(false);
        // Reports cancellation although the manager never cancelled it.
        manager
            .on_next(operation(|_| async { Err(FeedError::Cancelled) }))
            .unwrap();
        manager.on_completed();

        assert_eq!(manager.completion().await, Err(FeedError::Cancelled));
    }
}
