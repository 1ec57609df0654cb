//! End-to-end scenarios
//!
//! Each scenario drives real feeds or operation managers and returns a
//! `ScenarioResult` listing every violated expectation instead of
//! panicking, so the same scenario can run from tests and from tooling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use feedflow_core::{FeedError, FeedResult, FeedValue, Message};
use feedflow_operations::{
    create_manager, operation, AsyncOperation, AsyncOperationsManager, ConcurrencyMode,
};
use feedflow_runtime::{
    DerivedFeed, ExecuteRequest, FeedContext, FeedExecution, FeedSession, SessionStream, State,
};

use crate::{EventLog, Gate, Jitter, Occupancy, ScriptedFeed};

/// Scenario tuning
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    /// Seed for every jitter source
    pub seed: u64,
    /// Jitter bounds in milliseconds
    pub jitter_ms: (u64, u64),
    /// Rounds for the looping scenarios
    pub iterations: usize,
    /// Upper bound for any single wait
    pub timeout: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            seed: 42,
            jitter_ms: (0, 3),
            iterations: 20,
            timeout: Duration::from_secs(2),
        }
    }
}

impl ScenarioConfig {
    /// No jitter, few rounds
    pub fn minimal() -> Self {
        ScenarioConfig {
            jitter_ms: (0, 0),
            iterations: 5,
            ..Default::default()
        }
    }

    /// Many rounds with wider jitter
    pub fn stress() -> Self {
        ScenarioConfig {
            jitter_ms: (0, 5),
            iterations: 100,
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn jitter(&self) -> Jitter {
        let (min, max) = self.jitter_ms;
        if max == 0 {
            Jitter::none()
        } else {
            Jitter::new(self.seed, min, max)
        }
    }
}

/// Outcome of one scenario
#[derive(Clone, Debug, Default)]
pub struct ScenarioResult {
    pub name: &'static str,
    /// Owner executions observed
    pub executions: usize,
    /// Owner messages received
    pub messages: usize,
    /// Violated expectations
    pub violations: Vec<String>,
}

impl ScenarioResult {
    pub fn new(name: &'static str) -> Self {
        ScenarioResult {
            name,
            ..Default::default()
        }
    }

    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn check(&mut self, ok: bool, violation: impl Into<String>) {
        if !ok {
            self.violation(violation);
        }
    }

    pub fn violation(&mut self, violation: impl Into<String>) {
        let violation = violation.into();
        tracing::warn!(scenario = self.name, %violation, "scenario violation");
        self.violations.push(violation);
    }
}

async fn next_message<T, S>(stream: &mut S, timeout: Duration) -> Option<Message<T>>
where
    S: Stream<Item = FeedResult<Message<T>>> + Unpin,
{
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(Ok(message))) => Some(message),
        _ => None,
    }
}

/// Drain messages until the session is idle and quiet
async fn settle<T: FeedValue>(stream: &mut SessionStream<T>, timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut drained = 0;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(30), stream.next()).await {
            Ok(Some(_)) => drained += 1,
            Ok(None) => break,
            Err(_) if stream.session().current_execution().is_none() => break,
            Err(_) => {}
        }
    }
    drained
}

/// Root session over a derived feed, with access to its session handle
fn open<T: FeedValue>(feed: &DerivedFeed<T>) -> FeedResult<SessionStream<T>> {
    let context = FeedContext::default().enter(feed.id())?;
    Ok(FeedSession::start(
        feed.id(),
        context,
        CancellationToken::new(),
        feed.body(),
    ))
}

// ============================================================================
// FEED SCENARIOS
// ============================================================================

/// No two executions ever hold the same upstream at once
pub async fn concurrent_pins(config: &ScenarioConfig) -> ScenarioResult {
    let mut result = ScenarioResult::new("concurrent_pins");
    let source = State::with_value(0u32);
    let occupancy = Occupancy::new();
    let jitter = Arc::new(config.jitter());
    let runs = Arc::new(AtomicUsize::new(0));

    let derived = {
        let feed = source.feed();
        let occupancy = occupancy.clone();
        let jitter = Arc::clone(&jitter);
        let runs = Arc::clone(&runs);
        DerivedFeed::new(move |execution: FeedExecution| {
            let feed = Arc::clone(&feed);
            let occupancy = occupancy.clone();
            let jitter = Arc::clone(&jitter);
            runs.fetch_add(1, Ordering::SeqCst);
            async move {
                let value = execution.data(&feed).await?;
                let _inside = occupancy.enter();
                jitter.pause().await;
                Ok(value)
            }
        })
    };

    let mut stream = match open(&derived) {
        Ok(stream) => stream,
        Err(error) => {
            result.violation(format!("session refused: {}", error));
            return result;
        }
    };
    if next_message(&mut stream, config.timeout).await.is_none() {
        result.violation("no first message");
        return result;
    }

    for round in 0..config.iterations {
        if round % 2 == 0 {
            stream
                .session()
                .execute(ExecuteRequest::new(format!("poke {}", round)));
        } else {
            source.set(Some(round as u32));
        }
        jitter.pause().await;
    }
    result.messages = settle(&mut stream, config.timeout).await;

    result.check(
        occupancy.peak() <= 1,
        format!("{} executions held the upstream at once", occupancy.peak()),
    );
    let last = stream
        .session()
        .last_message()
        .and_then(|message| message.current().data().copied());
    result.check(
        last == source.value(),
        format!("owner settled on {:?}, upstream is {:?}", last, source.value()),
    );

    result.executions = runs.load(Ordering::SeqCst);
    result
}

/// After an upstream failure the owner keeps serving the last value
pub async fn stale_but_available(config: &ScenarioConfig) -> ScenarioResult {
    let mut result = ScenarioResult::new("stale_but_available");
    let source = ScriptedFeed::<u32>::new();
    source.emit(1);

    let runs = Arc::new(AtomicUsize::new(0));
    let derived = {
        let runs = Arc::clone(&runs);
        DerivedFeed::select(source.feed(), move |value: &u32| {
            runs.fetch_add(1, Ordering::SeqCst);
            Some(value * 10)
        })
    };
    let mut stream = match open(&derived) {
        Ok(stream) => stream,
        Err(error) => {
            result.violation(format!("session refused: {}", error));
            return result;
        }
    };
    if next_message(&mut stream, config.timeout).await.is_none() {
        result.violation("no first message");
        return result;
    }
    result.messages += 1;

    source.fail(FeedError::execution("connection lost"));
    let deadline = tokio::time::Instant::now() + config.timeout;
    while !stream.session().active_dependencies().is_empty() {
        if tokio::time::Instant::now() >= deadline {
            result.violation("failed upstream was never unregistered");
            return result;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    stream.session().execute(ExecuteRequest::new("refresh"));
    result.messages += settle(&mut stream, config.timeout).await;

    result.executions = runs.load(Ordering::SeqCst);
    result.check(result.executions == 2, "refresh did not re-run the owner");
    match stream.session().last_message() {
        Some(last) => {
            result.check(last.current().data() == Some(&10), "last value was lost");
            result.check(last.current().error().is_none(), "upstream failure leaked as error");
        }
        None => result.violation("session has no message"),
    }
    result
}

// ============================================================================
// OPERATION SCENARIOS
// ============================================================================

fn logged(log: &EventLog, jitter: &Arc<Jitter>, name: &'static str) -> AsyncOperation {
    let log = log.clone();
    let jitter = Arc::clone(jitter);
    operation(move |_| async move {
        log.record(format!("start {}", name));
        jitter.pause().await;
        log.record(format!("end {}", name));
        Ok(())
    })
}

/// Records "cancelled <name>" unless the operation reached its end
struct Unfinished {
    log: EventLog,
    name: &'static str,
    finished: bool,
}

impl Drop for Unfinished {
    fn drop(&mut self) {
        if !self.finished {
            self.log.record(format!("cancelled {}", self.name));
        }
    }
}

fn blocking(log: &EventLog, gate: &Gate, started: &Gate, name: &'static str) -> AsyncOperation {
    let log = log.clone();
    let gate = gate.clone();
    let started = started.clone();
    operation(move |token| async move {
        // The manager may drop this future outright when it cancels it.
        let mut marker = Unfinished {
            log: log.clone(),
            name,
            finished: false,
        };
        log.record(format!("start {}", name));
        started.open();
        tokio::select! {
            _ = token.cancelled() => Err(FeedError::Cancelled),
            _ = gate.wait() => {
                log.record(format!("end {}", name));
                marker.finished = true;
                Ok(())
            }
        }
    })
}

/// Queue runs A, B, C strictly in order and drains after the last one
pub async fn queue_ordering(config: &ScenarioConfig) -> ScenarioResult {
    let mut result = ScenarioResult::new("queue_ordering");
    let manager = create_manager(ConcurrencyMode::Queue, false);
    let log = EventLog::new();
    let jitter = Arc::new(config.jitter());

    for name in ["A", "B", "C"] {
        if let Err(error) = manager.on_next(logged(&log, &jitter, name)) {
            result.violation(format!("submission {} rejected: {}", name, error));
        }
    }

    log.wait_for_len(6, config.timeout).await;
    let early = tokio::time::timeout(Duration::from_millis(20), manager.completion()).await;
    result.check(early.is_err(), "drained before on_completed");

    manager.on_completed();
    match tokio::time::timeout(config.timeout, manager.completion()).await {
        Ok(outcome) => result.check(outcome.is_ok(), format!("completion failed: {:?}", outcome)),
        Err(_) => result.violation("never drained"),
    }

    let expected = ["start A", "end A", "start B", "end B", "start C", "end C"];
    result.check(
        log.snapshot() == expected,
        format!("order was {:?}", log.snapshot()),
    );
    result
}

/// AbortPrevious cancels A when B arrives and swallows A's cancellation
pub async fn abort_previous(config: &ScenarioConfig) -> ScenarioResult {
    let mut result = ScenarioResult::new("abort_previous");
    let manager = create_manager(ConcurrencyMode::AbortPrevious, false);
    let log = EventLog::new();
    let never = Gate::new();
    let started = Gate::new();
    let jitter = Arc::new(config.jitter());

    if manager.on_next(blocking(&log, &never, &started, "A")).is_err() {
        result.violation("A rejected");
        return result;
    }
    started.wait().await;
    if manager.on_next(logged(&log, &jitter, "B")).is_err() {
        result.violation("B rejected");
        return result;
    }
    manager.on_completed();

    match tokio::time::timeout(config.timeout, manager.completion()).await {
        Ok(outcome) => result.check(
            outcome.is_ok(),
            format!("superseded cancellation surfaced: {:?}", outcome),
        ),
        Err(_) => result.violation("never drained"),
    }
    result.check(log.count("cancelled A") == 1, "A was not cancelled");
    result.check(log.count("end B") == 1, "B did not run");
    result
}

/// Every policy rejects work after completing, faulting or disposal
pub async fn post_terminal_contract(config: &ScenarioConfig) -> ScenarioResult {
    let mut result = ScenarioResult::new("post_terminal_contract");
    let noop = || operation(|_| async { Ok(()) });

    for mode in ConcurrencyMode::ALL {
        let completed = create_manager(mode, false);
        completed.on_completed();
        result.check(
            completed.on_next(noop()) == Err(FeedError::OperationsCompleted),
            format!("{}: submission after on_completed accepted", mode),
        );

        let faulted = create_manager(mode, false);
        faulted.on_error(FeedError::operation("upstream"));
        result.check(
            faulted.on_next(noop()) == Err(FeedError::OperationsDisposed),
            format!("{}: submission after fault accepted", mode),
        );
        // Terminal: a later completion is ignored
        faulted.on_completed();
        match tokio::time::timeout(config.timeout, faulted.completion()).await {
            Ok(outcome) => result.check(
                outcome == Err(FeedError::OperationFailed("upstream".into())),
                format!("{}: fault outcome was {:?}", mode, outcome),
            ),
            Err(_) => result.violation(format!("{}: fault never resolved", mode)),
        }

        let disposed = create_manager(mode, false);
        disposed.dispose();
        result.check(
            disposed.on_next(noop()) == Err(FeedError::OperationsDisposed),
            format!("{}: submission after dispose accepted", mode),
        );
    }
    result
}

/// Every scenario with one configuration
pub async fn run_all(config: &ScenarioConfig) -> Vec<ScenarioResult> {
    vec![
        concurrent_pins(config).await,
        stale_but_available(config).await,
        queue_ordering(config).await,
        abort_previous(config).await,
        post_terminal_contract(config).await,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_passed(result: ScenarioResult) {
        assert!(
            result.passed(),
            "{} failed: {:?}",
            result.name,
            result.violations
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pins() {
        for seed in 0..4 {
            let config = ScenarioConfig::default().with_seed(seed);
            assert_passed(concurrent_pins(&config).await);
        }
    }

    #[tokio::test]
    async fn test_concurrent_pins_without_jitter() {
        assert_passed(concurrent_pins(&ScenarioConfig::minimal()).await);
    }

    #[tokio::test]
    async fn test_stale_but_available() {
        assert_passed(stale_but_available(&ScenarioConfig::default()).await);
    }

    #[tokio::test]
    async fn test_queue_ordering() {
        assert_passed(queue_ordering(&ScenarioConfig::default()).await);
    }

    #[tokio::test]
    async fn test_abort_previous() {
        assert_passed(abort_previous(&ScenarioConfig::default()).await);
    }

    #[tokio::test]
    async fn test_post_terminal_contract() {
        assert_passed(post_terminal_contract(&ScenarioConfig::minimal()).await);
    }

    #[tokio::test]
    async fn test_scenario_result() {
        let mut result = ScenarioResult::new("sample");
        result.check(true, "fine");
        assert!(result.passed());
        result.check(false, "broken");
        assert_eq!(result.violations, vec!["broken".to_string()]);
    }
}
