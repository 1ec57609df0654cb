//! Queue policy: operations run one at a time, in submission order

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use feedflow_core::{FeedError, FeedResult};

use crate::manager::{run_operation, ManagerCore};
use crate::{AsyncOperation, AsyncOperationsManager, ConcurrencyMode};

struct SequentialInner {
    core: ManagerCore,
    queue: Mutex<VecDeque<AsyncOperation>>,
    /// Set while a pump task owns the queue
    pumping: AtomicBool,
}

impl SequentialInner {
    /// Drain the queue until it is empty, then hand the pump back
    async fn pump(self: Arc<Self>) {
        loop {
            if self.core.is_cancelled() {
                self.queue.lock().clear();
                self.pumping.store(false, Ordering::SeqCst);
                break;
            }

            let next = self.queue.lock().pop_front();
            match next {
                Some(operation) => {
                    let token = self.core.child_token();
                    run_operation(&self.core, operation, token).await;
                }
                None => {
                    self.pumping.store(false, Ordering::SeqCst);
                    // A submission may have slipped in between the pop and the store.
                    let retake = !self.queue.lock().is_empty()
                        && self
                            .pumping
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok();
                    if !retake {
                        break;
                    }
                }
            }
        }

        self.try_drain();
    }

    fn try_drain(&self) {
        if self.core.is_completing()
            && !self.pumping.load(Ordering::SeqCst)
            && self.queue.lock().is_empty()
        {
            self.core.drained();
        }
    }

    fn complete(&self) {
        if self.core.mark_completed() {
            self.try_drain();
        }
    }
}

/// Sequential (FIFO) operations manager
pub struct SequentialOperationsManager {
    inner: Arc<SequentialInner>,
}

impl SequentialOperationsManager {
    pub fn new(silent_errors: bool) -> Self {
        SequentialOperationsManager {
            inner: Arc::new(SequentialInner {
                core: ManagerCore::new(ConcurrencyMode::Queue, silent_errors),
                queue: Mutex::new(VecDeque::new()),
                pumping: AtomicBool::new(false),
            }),
        }
    }

    /// Operations waiting behind the running one
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl AsyncOperationsManager for SequentialOperationsManager {
    fn mode(&self) -> ConcurrencyMode {
        self.inner.core.mode()
    }

    fn on_next(&self, operation: AsyncOperation) -> FeedResult<()> {
        self.inner.core.check_accepting()?;
        self.inner.queue.lock().push_back(operation);

        if self
            .inner
            .pumping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(Arc::clone(&self.inner).pump());
        }
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
        self.inner.queue.lock().clear();
    }

    fn completion(&self) -> BoxFuture<'static, FeedResult<()>> {
        self.inner.core.completion()
    }
}

impl Drop for SequentialOperationsManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
