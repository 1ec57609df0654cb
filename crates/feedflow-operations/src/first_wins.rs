//! IgnoreNew policy: submissions while busy are dropped

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use feedflow_core::{FeedError, FeedResult};

use crate::manager::{run_operation, ManagerCore};
use crate::{AsyncOperation, AsyncOperationsManager, ConcurrencyMode};

struct FirstWinsInner {
    core: ManagerCore,
    running: AtomicBool,
}

impl FirstWinsInner {
    fn try_drain(&self) {
        if self.core.is_completing() && !self.running.load(Ordering::SeqCst) {
            self.core.drained();
        }
    }

    fn complete(&self) {
        if self.core.mark_completed() {
            self.try_drain();
        }
    }
}

/// First-wins operations manager
pub struct FirstWinsOperationsManager {
    inner: Arc<FirstWinsInner>,
}

impl FirstWinsOperationsManager {
    pub fn new(silent_errors: bool) -> Self {
        FirstWinsOperationsManager {
            inner: Arc::new(FirstWinsInner {
                core: ManagerCore::new(ConcurrencyMode::IgnoreNew, silent_errors),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl AsyncOperationsManager for FirstWinsOperationsManager {
    fn mode(&self) -> ConcurrencyMode {
        self.inner.core.mode()
    }

    fn on_next(&self, operation: AsyncOperation) -> FeedResult<()> {
        self.inner.core.check_accepting()?;

        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("operation dropped, another one is running");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let token = inner.core.child_token();
        tokio::spawn(async move {
            run_operation(&inner.core, operation, token).await;
            inner.running.store(false, Ordering::SeqCst);
            inner.try_drain();
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

impl Drop for FirstWinsOperationsManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
