//! Operations manager contract and shared terminal-state machinery

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedError, FeedResult};

use crate::{
    ConcurrencyMode, FirstWinsOperationsManager, LastWinsOperationsManager, OperationsConfig,
    ParallelOperationsManager, SequentialOperationsManager,
};

/// A user action: receives the token it must honor, resolves when done
pub type AsyncOperation =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, FeedResult<()>> + Send>;

/// Box an async closure as an `AsyncOperation`
pub fn operation<F, Fut>(f: F) -> AsyncOperation
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = FeedResult<()>> + Send + 'static,
{
    Box::new(move |token| f(token).boxed())
}

/// Concurrency policy for a sequence of asynchronous user actions
pub trait AsyncOperationsManager: Send + Sync {
    /// Policy of this manager
    fn mode(&self) -> ConcurrencyMode;

    /// Submit an operation
    ///
    /// Fails with `OperationsCompleted` after `on_completed`, and with
    /// `OperationsDisposed` after the manager faulted or was disposed.
    fn on_next(&self, operation: AsyncOperation) -> FeedResult<()>;

    /// Upstream failed. Ignored once the manager is terminal.
    fn on_error(&self, error: FeedError);

    /// Upstream completed. Ignored once the manager is terminal.
    fn on_completed(&self);

    /// Cancel everything in flight and refuse further submissions
    fn dispose(&self);

    /// Resolves once drained (upstream completed, nothing pending or
    /// running), or with the first unsilenced error.
    fn completion(&self) -> BoxFuture<'static, FeedResult<()>>;
}

/// Build the manager for `mode`
pub fn create_manager(mode: ConcurrencyMode, silent_errors: bool) -> Arc<dyn AsyncOperationsManager> {
    create_manager_with(OperationsConfig {
        mode,
        silent_errors,
    })
}

/// Build the manager described by `config`
pub fn create_manager_with(config: OperationsConfig) -> Arc<dyn AsyncOperationsManager> {
    match config.mode {
        ConcurrencyMode::Queue => Arc::new(SequentialOperationsManager::new(config.silent_errors)),
        ConcurrencyMode::AbortPrevious => {
            Arc::new(LastWinsOperationsManager::new(config.silent_errors))
        }
        ConcurrencyMode::IgnoreNew => Arc::new(FirstWinsOperationsManager::new(config.silent_errors)),
        ConcurrencyMode::Parallel => Arc::new(ParallelOperationsManager::new(config.silent_errors)),
    }
}

// ============================================================================
// SHARED CORE
// ============================================================================

const ACTIVE: u8 = 0;
const COMPLETING: u8 = 1;
const DRAINED: u8 = 2;
const FAULTED: u8 = 3;
const DISPOSED: u8 = 4;

/// Terminal-state machine shared by all four managers
///
/// `ACTIVE -> COMPLETING -> DRAINED`, or `ACTIVE|COMPLETING -> FAULTED|DISPOSED`.
/// Every transition is a compare-and-swap, so each terminal outcome is
/// published exactly once.
pub(crate) struct ManagerCore {
    mode: ConcurrencyMode,
    silent_errors: bool,
    state: AtomicU8,
    /// Parent of every operation token; cancelled on fault or dispose
    token: CancellationToken,
    done: watch::Sender<Option<FeedResult<()>>>,
}

impl ManagerCore {
    pub(crate) fn new(mode: ConcurrencyMode, silent_errors: bool) -> Self {
        let (done, _) = watch::channel(None);
        ManagerCore {
            mode,
            silent_errors,
            state: AtomicU8::new(ACTIVE),
            token: CancellationToken::new(),
            done,
        }
    }

    #[inline]
    pub(crate) fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    /// Token for a new operation
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn is_completing(&self) -> bool {
        self.state.load(Ordering::SeqCst) == COMPLETING
    }

    /// Submission guard
    pub(crate) fn check_accepting(&self) -> FeedResult<()> {
        match self.state.load(Ordering::SeqCst) {
            ACTIVE => Ok(()),
            COMPLETING | DRAINED => Err(FeedError::OperationsCompleted),
            _ => Err(FeedError::OperationsDisposed),
        }
    }

    /// Record upstream completion. False if already completed or terminal.
    pub(crate) fn mark_completed(&self) -> bool {
        let marked = self
            .state
            .compare_exchange(ACTIVE, COMPLETING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if marked {
            tracing::debug!(mode = %self.mode, "operations upstream completed");
        }
        marked
    }

    /// Publish successful drain; no-op unless completing
    pub(crate) fn drained(&self) {
        if self
            .state
            .compare_exchange(COMPLETING, DRAINED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::debug!(mode = %self.mode, "operations drained");
            self.done.send_replace(Some(Ok(())));
        }
    }

    /// Fault the manager with `error`, cancelling everything in flight
    pub(crate) fn fault(&self, error: FeedError) {
        let faulted = [ACTIVE, COMPLETING].into_iter().any(|from| {
            self.state
                .compare_exchange(from, FAULTED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });

        if faulted {
            tracing::warn!(mode = %self.mode, error = %error, "operations manager faulted");
            self.token.cancel();
            self.done.send_replace(Some(Err(error)));
        } else {
            tracing::debug!(mode = %self.mode, error = %error, "error after terminal state ignored");
        }
    }

    pub(crate) fn dispose(&self) {
        let disposed = [ACTIVE, COMPLETING].into_iter().any(|from| {
            self.state
                .compare_exchange(from, DISPOSED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });

        self.token.cancel();
        if disposed {
            tracing::debug!(mode = %self.mode, "operations manager disposed");
            self.done.send_replace(Some(Err(FeedError::Cancelled)));
        }
    }

    /// Apply the error policy to an upstream or operation failure.
    ///
    /// Returns true when the failure was silenced and should be treated as
    /// a plain completion by the caller.
    pub(crate) fn report_failure(&self, error: FeedError) -> bool {
        if self.silent_errors {
            tracing::warn!(mode = %self.mode, error = %error, "operation failed (silenced)");
            true
        } else {
            self.fault(error);
            false
        }
    }

    /// Classify the outcome of one operation
    pub(crate) fn settle(&self, outcome: FeedResult<()>, token: &CancellationToken) {
        match outcome {
            Ok(()) => {}
            Err(FeedError::Cancelled) if token.is_cancelled() => {
                tracing::trace!(mode = %self.mode, "operation cancelled by manager");
            }
            Err(error) => {
                self.report_failure(error);
            }
        }
    }

    pub(crate) fn completion(&self) -> BoxFuture<'static, FeedResult<()>> {
        let mut done = self.done.subscribe();
        async move {
            loop {
                let outcome = done.borrow_and_update().clone();
                if let Some(result) = outcome {
                    return result;
                }
                if done.changed().await.is_err() {
                    return Err(FeedError::Cancelled);
                }
            }
        }
        .boxed()
    }
}

/// Run one operation under `token`; dropping the future is the cancellation
pub(crate) async fn run_operation(core: &ManagerCore, operation: AsyncOperation, token: CancellationToken) {
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Err(FeedError::Cancelled),
        outcome = operation(token.clone()) => outcome,
    };
    core.settle(outcome, &token);
}
