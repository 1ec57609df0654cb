//! Parallel policy: every submission runs immediately

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use feedflow_core::{FeedError, FeedResult};

use crate::manager::{run_operation, ManagerCore};
use crate::{AsyncOperation, AsyncOperationsManager, ConcurrencyMode};

struct ParallelInner {
    core: ManagerCore,
    /// Starts at 1 for the upstream; +1 per fired operation
    pending: AtomicUsize,
}

impl ParallelInner {
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

/// Unbounded fan-out operations manager
pub struct ParallelOperationsManager {
    inner: Arc<ParallelInner>,
}

impl ParallelOperationsManager {
    pub fn new(silent_errors: bool) -> Self {
        ParallelOperationsManager {
            inner: Arc::new(ParallelInner {
                core: ManagerCore::new(ConcurrencyMode::Parallel, silent_errors),
                pending: AtomicUsize::new(1),
            }),
        }
    }

    /// Operations still running
    pub fn in_flight(&self) -> usize {
        let pending = self.inner.pending.load(Ordering::SeqCst);
        if self.inner.core.is_completing() {
            pending
        } else {
            pending.saturating_sub(1)
        }
    }
}

impl AsyncOperationsManager for ParallelOperationsManager {
    fn mode(&self) -> ConcurrencyMode {
        self.inner.core.mode()
    }

    fn on_next(&self, operation: AsyncOperation) -> FeedResult<()> {
        self.inner.core.check_accepting()?;

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let token = inner.core.child_token();
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

impl Drop for ParallelOperationsManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
