//! Per-execution attempt orchestration.
//!
//! One [`AttemptTracker`] is created per logical operation invocation. It
//! owns the attempt counter, the last-seen failure and response, and the
//! chronological failure history used to build the final aggregated error
//! when retries run out.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::{ClockOffset, SkewSignal};
use crate::error::{ExhaustionKind, RetryError};
use crate::failure::AttemptFailure;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::strategy::{RetryStrategy, RetryToken};

/// Lifecycle of one tracked execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// No attempt has started yet.
    NotStarted,
    /// At least one attempt has started and no terminal event occurred.
    Attempting,
    /// An attempt succeeded.
    Succeeded,
    /// The strategy refused further attempts.
    Exhausted,
}

/// Per-execution state machine wrapping one [`RetryStrategy`].
///
/// The type parameter `R` is the caller's response shape; the tracker only
/// stores the last response for the caller to inspect between attempts.
#[derive(Debug)]
pub struct AttemptTracker<R = ()> {
    strategy: Arc<dyn RetryStrategy>,
    scope: String,
    state: TrackerState,
    attempt: u32,
    token: Option<RetryToken>,
    last_failure: Option<AttemptFailure>,
    last_response: Option<R>,
    failure_history: Vec<String>,
    terminal_kind: Option<ExhaustionKind>,
    clock_offset: Arc<ClockOffset>,
    metrics: Arc<dyn MetricsSink>,
    metrics_reported: bool,
}

impl<R> AttemptTracker<R> {
    /// Create a tracker for one logical execution in the given scope.
    pub fn new(strategy: Arc<dyn RetryStrategy>, scope: impl Into<String>) -> Self {
        Self {
            strategy,
            scope: scope.into(),
            state: TrackerState::NotStarted,
            attempt: 0,
            token: None,
            last_failure: None,
            last_response: None,
            failure_history: Vec::new(),
            terminal_kind: None,
            clock_offset: Arc::new(ClockOffset::new()),
            metrics: Arc::new(NoopMetrics),
            metrics_reported: false,
        }
    }

    /// Share a clock offset with the signing collaborator.
    pub fn with_clock_offset(mut self, clock_offset: Arc<ClockOffset>) -> Self {
        self.clock_offset = clock_offset;
        self
    }

    /// Report terminal counters to the given sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The failure recorded for the most recent attempt, unwrapped.
    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.last_failure.as_ref()
    }

    /// The response recorded for the most recent attempt.
    pub fn last_response(&self) -> Option<&R> {
        self.last_response.as_ref()
    }

    /// The clock offset this tracker adjusts on skew signals.
    pub fn clock_offset(&self) -> &Arc<ClockOffset> {
        &self.clock_offset
    }

    /// Begin a new attempt. Must be called before each send.
    ///
    /// Returns the attempt number, counting from 1.
    pub fn starting_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.state = TrackerState::Attempting;
        debug!(scope = %self.scope, attempt = self.attempt, "starting attempt");
        self.attempt
    }

    /// Acquire the execution's retry token before the first attempt.
    ///
    /// Returns the delay to impose before sending, usually zero.
    pub fn acquire_initial_token(&mut self) -> Duration {
        let (token, delay) = self.strategy.acquire_initial_token(&self.scope);
        self.token = Some(token);
        delay
    }

    /// Ask the strategy whether the recorded failure may be retried.
    ///
    /// Returns `Ok(Some(delay))` when the retry is permitted, `Ok(None)`
    /// when it is refused, in which case the tracker is exhausted and
    /// [`AttemptTracker::build_exhaustion_failure`] produces the final
    /// error. Non-retryable failures exhaust the tracker without consulting
    /// the strategy at all.
    pub fn try_refresh_token(
        &mut self,
        suggested_delay: Option<Duration>,
    ) -> Result<Option<Duration>, RetryError> {
        let Some(failure) = self.last_failure.clone() else {
            return Ok(None);
        };
        if !failure.is_retryable() {
            self.exhaust(ExhaustionKind::NonRetryable);
            return Ok(None);
        }

        if self.token.is_none() {
            self.acquire_initial_token();
        }
        let token = self.token.as_ref().cloned();
        let Some(token) = token else {
            return Ok(None);
        };

        match self.strategy.refresh_token(&token, &failure, suggested_delay) {
            Ok((refreshed, delay)) => {
                self.token = Some(refreshed);
                Ok(Some(delay))
            }
            Err(error @ RetryError::StaleToken { .. }) => Err(error),
            Err(error) => {
                if let Some(token) = error.token() {
                    self.token = Some(token.clone());
                }
                self.exhaust(
                    error
                        .exhaustion_kind()
                        .unwrap_or(ExhaustionKind::MaxAttemptsReached),
                );
                Ok(None)
            }
        }
    }

    /// Record the classified failure of the attempt that just finished.
    ///
    /// Completion wrappers are stripped before the failure is stored, and
    /// the unwrapped message is appended to the failure history.
    pub fn set_last_failure(&mut self, failure: AttemptFailure) {
        let unwrapped = failure.unwrapped().clone();
        self.failure_history.push(unwrapped.message().to_owned());
        self.last_failure = Some(unwrapped);
    }

    /// Record the response of the attempt that just finished.
    pub fn set_last_response(&mut self, response: R) {
        self.last_response = Some(response);
    }

    /// Apply a clock-skew signal derived from the last response.
    ///
    /// The shared offset must be updated before the next attempt's request
    /// is prepared, so the signing collaborator picks it up.
    pub fn apply_clock_skew(&mut self, signal: Option<SkewSignal>) {
        if let Some(signal) = signal {
            debug!(
                scope = %self.scope,
                offset_millis = signal.offset_millis,
                "adjusting shared clock offset after skewed response"
            );
            self.clock_offset.set_millis(signal.offset_millis);
        }
    }

    /// Record that the current attempt succeeded.
    ///
    /// Reports terminal counters and credits the token pool.
    pub fn record_attempt_succeeded(&mut self) -> Result<(), RetryError> {
        if let Some(token) = self.token.as_ref().cloned() {
            let succeeded = self.strategy.record_success(&token)?;
            self.token = Some(succeeded);
        }
        self.state = TrackerState::Succeeded;
        self.report_metrics();
        Ok(())
    }

    /// Build the final aggregated error after retries were refused.
    ///
    /// The primary message is the last failure's message; every earlier
    /// attempt's message becomes a suppressed entry labeled with its
    /// 1-based attempt index.
    pub fn build_exhaustion_failure(&self) -> RetryError {
        let kind = self
            .terminal_kind
            .unwrap_or(ExhaustionKind::MaxAttemptsReached);
        let message = self
            .failure_history
            .last()
            .cloned()
            .unwrap_or_else(|| "request failed without a recorded failure".to_owned());
        let prior = self.failure_history.len().saturating_sub(1);
        let suppressed = self.failure_history[..prior]
            .iter()
            .enumerate()
            .map(|(index, message)| format!("attempt {} failure: {}", index + 1, message))
            .collect();
        RetryError::RetriesExhausted {
            kind,
            message,
            suppressed,
        }
    }

    /// Diagnostic header for the next attempt's request.
    pub fn retry_info_header(&self) -> String {
        match &self.token {
            Some(token) => self.strategy.retry_info_header(token),
            None => format!(
                "attempt={}; max={}",
                self.attempt.max(1),
                self.strategy.max_attempts()
            ),
        }
    }

    fn exhaust(&mut self, kind: ExhaustionKind) {
        self.state = TrackerState::Exhausted;
        self.terminal_kind = Some(kind);
        self.report_metrics();
    }

    fn report_metrics(&mut self) {
        if !self.metrics_reported {
            self.metrics
                .record_execution(&self.scope, self.attempt, self.attempt.saturating_sub(1));
            self.metrics_reported = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryImmediately;
    use crate::strategy::StandardRetryStrategy;
    use crate::token_bucket::TokenBucketStore;
    use std::fmt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMetrics {
        executions: Mutex<Vec<(String, u32, u32)>>,
    }

    impl fmt::Debug for RecordingMetrics {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RecordingMetrics").finish()
        }
    }

    impl MetricsSink for RecordingMetrics {
        fn record_execution(&self, scope: &str, attempts: u32, retries: u32) {
            self.executions
                .lock()
                .unwrap()
                .push((scope.to_owned(), attempts, retries));
        }
    }

    fn immediate_strategy(max_attempts: u32) -> Arc<dyn RetryStrategy> {
        Arc::new(
            StandardRetryStrategy::builder()
                .max_attempts(max_attempts)
                .backoff(RetryImmediately::new())
                .build(),
        )
    }

    fn tracker(max_attempts: u32) -> AttemptTracker<u16> {
        AttemptTracker::new(immediate_strategy(max_attempts), "dynamodb")
    }

    #[test]
    fn attempt_counter_increments_by_one_from_one() {
        let mut tracker = tracker(5);
        assert_eq!(tracker.state(), TrackerState::NotStarted);
        assert_eq!(tracker.attempt(), 0);

        for expected in 1..=4 {
            assert_eq!(tracker.starting_attempt(), expected);
            assert_eq!(tracker.attempt(), expected);
        }
        assert_eq!(tracker.state(), TrackerState::Attempting);
    }

    #[test]
    fn exhaustion_after_max_attempts_carries_prior_failures_as_suppressed() {
        let metrics = Arc::new(RecordingMetrics::default());
        let mut tracker = tracker(3).with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>);
        tracker.acquire_initial_token();

        let mut attempts = 0;
        loop {
            tracker.starting_attempt();
            attempts += 1;
            tracker.set_last_failure(AttemptFailure::transient(format!(
                "connection reset on attempt {attempts}"
            )));
            match tracker.try_refresh_token(None).unwrap() {
                Some(delay) => assert_eq!(delay, Duration::ZERO),
                None => break,
            }
        }

        assert_eq!(attempts, 3);
        assert_eq!(tracker.state(), TrackerState::Exhausted);

        let error = tracker.build_exhaustion_failure();
        match &error {
            RetryError::RetriesExhausted {
                kind,
                message,
                suppressed,
            } => {
                assert_eq!(*kind, ExhaustionKind::MaxAttemptsReached);
                assert_eq!(message, "connection reset on attempt 3");
                assert_eq!(
                    suppressed,
                    &vec![
                        "attempt 1 failure: connection reset on attempt 1".to_owned(),
                        "attempt 2 failure: connection reset on attempt 2".to_owned(),
                    ]
                );
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }

        // Attempts and retries are reported exactly once.
        let executions = metrics.executions.lock().unwrap();
        assert_eq!(executions.as_slice(), &[("dynamodb".to_owned(), 3, 2)]);
    }

    #[test]
    fn non_retryable_failure_short_circuits_without_touching_the_pool() {
        let store = Arc::new(TokenBucketStore::with_bucket_capacity(100));
        let strategy = Arc::new(
            StandardRetryStrategy::builder()
                .max_attempts(3)
                .backoff(RetryImmediately::new())
                .token_bucket_store(Arc::clone(&store))
                .build(),
        );
        let mut tracker: AttemptTracker = AttemptTracker::new(strategy, "dynamodb");
        tracker.acquire_initial_token();

        tracker.starting_attempt();
        tracker.set_last_failure(AttemptFailure::non_retryable("validation error"));
        assert_eq!(tracker.try_refresh_token(None).unwrap(), None);

        assert_eq!(tracker.attempt(), 1);
        assert_eq!(tracker.state(), TrackerState::Exhausted);
        assert_eq!(store.bucket_for_scope("dynamodb").current_capacity(), 100);

        let error = tracker.build_exhaustion_failure();
        assert_eq!(error.exhaustion_kind(), Some(ExhaustionKind::NonRetryable));
    }

    #[test]
    fn success_reports_metrics_and_credits_the_pool() {
        let metrics = Arc::new(RecordingMetrics::default());
        let mut tracker = tracker(3).with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>);
        tracker.acquire_initial_token();

        tracker.starting_attempt();
        tracker.set_last_failure(AttemptFailure::transient("timeout"));
        assert!(tracker.try_refresh_token(None).unwrap().is_some());

        tracker.starting_attempt();
        tracker.set_last_response(200u16);
        tracker.record_attempt_succeeded().unwrap();

        assert_eq!(tracker.state(), TrackerState::Succeeded);
        assert_eq!(tracker.last_response(), Some(&200));

        let executions = metrics.executions.lock().unwrap();
        assert_eq!(executions.as_slice(), &[("dynamodb".to_owned(), 2, 1)]);
    }

    #[test]
    fn wrapped_failures_are_stored_unwrapped() {
        let mut tracker = tracker(3);
        tracker.acquire_initial_token();
        tracker.starting_attempt();

        tracker.set_last_failure(AttemptFailure::wrapped(AttemptFailure::wrapped(
            AttemptFailure::transient("root cause"),
        )));

        let stored = tracker.last_failure().unwrap();
        assert!(matches!(stored, AttemptFailure::Classified { .. }));
        assert_eq!(stored.message(), "root cause");
    }

    #[test]
    fn skew_signal_updates_the_shared_clock_offset() {
        let offset = Arc::new(ClockOffset::new());
        let mut tracker = tracker(3).with_clock_offset(Arc::clone(&offset));
        tracker.acquire_initial_token();
        tracker.starting_attempt();

        tracker.apply_clock_skew(None);
        assert_eq!(offset.current_millis(), 0);

        tracker.apply_clock_skew(Some(SkewSignal::new(-30_000)));
        assert_eq!(offset.current_millis(), -30_000);
    }

    #[test]
    fn header_reflects_the_modern_form() {
        let mut tracker = tracker(3);
        tracker.acquire_initial_token();
        tracker.starting_attempt();
        assert_eq!(tracker.retry_info_header(), "attempt=1; max=3");

        tracker.set_last_failure(AttemptFailure::transient("timeout"));
        assert!(tracker.try_refresh_token(None).unwrap().is_some());
        assert_eq!(tracker.retry_info_header(), "attempt=2; max=3");
    }
}
