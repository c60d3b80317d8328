//! Non-blocking waiter executor driven by the tokio timer.
//!
//! Decision logic is identical to the blocking executor; only the waiting
//! differs. Instead of parking a thread, the executor awaits a timer, so
//! the future returned by [`AsyncWaiterExecutor::run`] never blocks. All
//! bookkeeping lives in that single future: dropping or aborting it between
//! polls is the cancellation mechanism, and no further poll can start once
//! it is gone. An in-flight poll is not forcibly aborted here; its eventual
//! completion simply has no future left to resume into.

use std::fmt;
use std::future::Future;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::time::Instant;
use tracing::debug;

use crate::backoff::BackoffStrategy;
use crate::error::WaiterError;
use crate::waiter::{
    WaiterAcceptor, WaiterConfig, WaiterOutcome, WaiterResponse, WaiterState, failure_state_message,
    first_match,
};

/// Asynchronous waiter executor.
pub struct AsyncWaiterExecutor<T, E> {
    config: WaiterConfig,
    acceptors: Vec<WaiterAcceptor<T, E>>,
}

impl<T, E: fmt::Debug> AsyncWaiterExecutor<T, E> {
    /// Create an executor from a configuration and an ordered acceptor list.
    pub fn new(config: WaiterConfig, acceptors: Vec<WaiterAcceptor<T, E>>) -> Self {
        Self { config, acceptors }
    }

    /// Poll until an acceptor reports a terminal state.
    ///
    /// `poll` is invoked once per attempt and its future is awaited to
    /// completion before any acceptor is consulted, so attempts stay
    /// strictly sequential. The max-wait deadline is evaluated before the
    /// timer is armed, matching the blocking executor.
    pub async fn run<F, Fut>(&self, mut poll: F) -> Result<WaiterResponse<T, E>, WaiterError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut rng = SmallRng::from_os_rng();
        let mut attempt: u32 = 1;

        loop {
            let outcome = poll().await;

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
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
