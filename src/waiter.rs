//! Polling waiters: acceptors, configuration, and the blocking executor.
//!
//! A waiter repeatedly invokes a polling function until an acceptor
//! classifies the outcome as terminal. Acceptors are consulted in the
//! configured order and the first match wins; that ordering is part of the
//! caller-visible contract, not an implementation detail.

use std::fmt;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::debug;

use crate::backoff::{Backoff, BackoffStrategy, FixedDelay};
use crate::error::WaiterError;
use crate::sleep::{Sleeper, StdSleeper};

/// Default attempt ceiling for waiters.
pub const DEFAULT_WAITER_MAX_ATTEMPTS: u32 = 3;

/// Default fixed delay between waiter polls.
pub const DEFAULT_WAITER_POLL_DELAY: Duration = Duration::from_secs(5);

/// Terminal state an acceptor can transition the waiter to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterState {
    /// The awaited condition holds; stop and return the outcome.
    Success,
    /// Not there yet; back off and poll again.
    Retry,
    /// The awaited condition can no longer be reached; stop with an error.
    Failure,
}

type ResultMatcher<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type FailureMatcher<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Rule mapping a polled outcome to a terminal waiter state.
///
/// An acceptor matches either successful results or failures, never both.
pub struct WaiterAcceptor<T, E> {
    state: WaiterState,
    result_matcher: Option<ResultMatcher<T>>,
    failure_matcher: Option<FailureMatcher<E>>,
    message: Option<String>,
}

impl<T, E> WaiterAcceptor<T, E> {
    fn on_result(
        state: WaiterState,
        matcher: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            state,
            result_matcher: Some(Box::new(matcher)),
            failure_matcher: None,
            message: None,
        }
    }

    fn on_failure(
        state: WaiterState,
        matcher: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            state,
            result_matcher: None,
            failure_matcher: Some(Box::new(matcher)),
            message: None,
        }
    }

    /// Transition to SUCCESS when a result matches.
    pub fn success_on_result(matcher: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self::on_result(WaiterState::Success, matcher)
    }

    /// Transition to RETRY when a result matches.
    pub fn retry_on_result(matcher: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self::on_result(WaiterState::Retry, matcher)
    }

    /// Transition to FAILURE when a result matches.
    pub fn failure_on_result(matcher: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self::on_result(WaiterState::Failure, matcher)
    }

    /// Transition to SUCCESS when a failure matches.
    pub fn success_on_failure(matcher: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self::on_failure(WaiterState::Success, matcher)
    }

    /// Transition to RETRY when a failure matches.
    pub fn retry_on_failure(matcher: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self::on_failure(WaiterState::Retry, matcher)
    }

    /// Transition to FAILURE when a failure matches.
    pub fn failure_on_failure(matcher: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self::on_failure(WaiterState::Failure, matcher)
    }

    /// Catch-all acceptor that retries on any successful result.
    ///
    /// Configured last, it reproduces the default acceptor tail used by
    /// generated service waiters.
    pub fn retry_on_any_result() -> Self {
        Self::on_result(WaiterState::Retry, |_| true)
    }

    /// Attach a message used when this acceptor transitions to FAILURE.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The terminal state this acceptor transitions to.
    pub fn state(&self) -> WaiterState {
        self.state
    }

    /// The configured failure message, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this acceptor recognizes the successful result.
    pub fn matches_result(&self, result: &T) -> bool {
        self.result_matcher
            .as_ref()
            .is_some_and(|matcher| matcher(result))
    }

    /// Whether this acceptor recognizes the failure.
    pub fn matches_failure(&self, failure: &E) -> bool {
        self.failure_matcher
            .as_ref()
            .is_some_and(|matcher| matcher(failure))
    }
}

impl<T, E> fmt::Debug for WaiterAcceptor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterAcceptor")
            .field("state", &self.state)
            .field("matches", if self.result_matcher.is_some() {
                &"result"
            } else {
                &"failure"
            })
            .field("message", &self.message)
            .finish()
    }
}

/// Waiter tuning knobs.
#[derive(Debug, Clone)]
pub struct WaiterConfig {
    max_attempts: u32,
    backoff: Backoff,
    max_wait: Option<Duration>,
}

impl WaiterConfig {
    /// Create a configuration with default values: 3 attempts, a fixed
    /// 5 second poll delay, and no overall deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt ceiling.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff strategy between polls.
    pub fn backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.backoff = backoff.into();
        self
    }

    /// Set the overall deadline. Unset means unbounded.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub(crate) fn max_attempts_value(&self) -> u32 {
        self.max_attempts
    }

    pub(crate) fn backoff_value(&self) -> &Backoff {
        &self.backoff
    }

    pub(crate) fn max_wait_value(&self) -> Option<Duration> {
        self.max_wait
    }
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_WAITER_MAX_ATTEMPTS,
            backoff: FixedDelay::new(DEFAULT_WAITER_POLL_DELAY).into(),
            max_wait: None,
        }
    }
}

/// How a finished waiter run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterOutcome<T, E> {
    /// A SUCCESS acceptor matched a successful result.
    Response(T),
    /// A SUCCESS acceptor matched a failure.
    MatchedFailure(E),
}

/// Final outcome of a waiter run: the matched outcome plus the number of
/// attempts it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterResponse<T, E> {
    attempts_executed: u32,
    outcome: WaiterOutcome<T, E>,
}

impl<T, E> WaiterResponse<T, E> {
    pub(crate) fn new(attempts_executed: u32, outcome: WaiterOutcome<T, E>) -> Self {
        Self {
            attempts_executed,
            outcome,
        }
    }

    /// Number of polls executed, at least 1.
    pub fn attempts_executed(&self) -> u32 {
        self.attempts_executed
    }

    /// The matched outcome.
    pub fn outcome(&self) -> &WaiterOutcome<T, E> {
        &self.outcome
    }

    /// Consume the response, returning the matched outcome.
    pub fn into_outcome(self) -> WaiterOutcome<T, E> {
        self.outcome
    }
}

pub(crate) fn first_match<'a, T, E>(
    acceptors: &'a [WaiterAcceptor<T, E>],
    outcome: &Result<T, E>,
) -> Option<&'a WaiterAcceptor<T, E>> {
    acceptors.iter().find(|acceptor| match outcome {
        Ok(result) => acceptor.matches_result(result),
        Err(failure) => acceptor.matches_failure(failure),
    })
}

pub(crate) fn failure_state_message<T, E>(acceptor: &WaiterAcceptor<T, E>) -> String {
    acceptor
        .message()
        .unwrap_or("a waiter acceptor matched and transitioned the waiter to failure")
        .to_owned()
}

/// Blocking waiter executor.
///
/// Runs entirely on the calling thread; backoff sleeps block that thread
/// through the configured [`Sleeper`].
pub struct WaiterExecutor<T, E, S = StdSleeper> {
    config: WaiterConfig,
    acceptors: Vec<WaiterAcceptor<T, E>>,
    sleeper: S,
}

impl<T, E: fmt::Debug> WaiterExecutor<T, E> {
    /// Create an executor sleeping through [`StdSleeper`].
    pub fn new(config: WaiterConfig, acceptors: Vec<WaiterAcceptor<T, E>>) -> Self {
        Self::with_sleeper(config, acceptors, StdSleeper)
    }
}

impl<T, E: fmt::Debug, S: Sleeper> WaiterExecutor<T, E, S> {
    /// Create an executor with a custom sleeper, e.g. a cancellable one.
    pub fn with_sleeper(
        config: WaiterConfig,
        acceptors: Vec<WaiterAcceptor<T, E>>,
        sleeper: S,
    ) -> Self {
        Self {
            config,
            acceptors,
            sleeper,
        }
    }

    /// Poll until an acceptor reports a terminal state.
    ///
    /// Attempts are strictly sequential; the next poll never starts before
    /// the previous outcome has been classified. The max-wait deadline is
    /// checked before sleeping, so a retry whose delay would cross the
    /// deadline fails fast instead of waiting it out.
    pub fn run<F>(&self, mut poll: F) -> Result<WaiterResponse<T, E>, WaiterError<E>>
    where
        F: FnMut() -> Result<T, E>,
    {
        let started = Instant::now();
        let mut rng = SmallRng::from_os_rng();
        let mut attempt: u32 = 1;

        loop {
            let outcome = poll();

            let Some(acceptor) = first_match(&self.acceptors, &outcome) else {
                return Err(match outcome {
                    Ok(_) => WaiterError::UnmatchedResult { attempts: attempt },
                    Err(failure) => WaiterError::UnmatchedFailure {
                        attempts: attempt,
                        failure,
                    },
                });
            };

            match acceptor.state() {
                WaiterState::Success => {
                    debug!(attempt, "waiter reached success state");
                    let outcome = match outcome {
                        Ok(result) => WaiterOutcome::Response(result),
                        Err(failure) => WaiterOutcome::MatchedFailure(failure),
                    };
                    return Ok(WaiterResponse::new(attempt, outcome));
                }
                WaiterState::Failure => {
                    let message = failure_state_message(acceptor);
                    debug!(attempt, %message, "waiter reached failure state");
                    return Err(WaiterError::FailureState {
                        message,
                        failure: outcome.err(),
                    });
                }
                WaiterState::Retry => {
                    if attempt >= self.config.max_attempts_value() {
                        return Err(WaiterError::ExceededMaxAttempts { attempts: attempt });
                    }
                    let delay = self
                        .config
                        .backoff_value()
                        .compute_delay_with_rng(attempt, &mut rng);
                    if let Some(max_wait) = self.config.max_wait_value() {
                        if started.elapsed() + delay > max_wait {
                            return Err(WaiterError::ExceededMaxWaitTime {
                                attempts: attempt,
                                max_wait,
                            });
                        }
                    }
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "waiter retrying after delay");
                    self.sleeper
                        .sleep(delay)
                        .map_err(|_| WaiterError::Interrupted)?;
                    attempt += 1;
                }
            }
        }
    }
}
