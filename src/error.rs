//! Error types surfaced by the retry and waiter machinery.
//!
//! Callers are expected to match on variants, not on message text, to tell
//! exhausted retries, refused retries, and waiter misconfiguration apart.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::strategy::RetryToken;

/// Why a retry execution reached its terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionKind {
    /// The per-execution attempt ceiling was reached.
    MaxAttemptsReached,
    /// The shared capacity pool refused the retry.
    CapacityExhausted,
    /// The failure was classified as non-retryable.
    NonRetryable,
}

/// Errors produced by retry strategies and the attempt tracker.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The failure was classified as non-retryable; no budget was consumed.
    #[error("request attempt {attempt} encountered non-retryable failure")]
    NonRetryable {
        /// Attempt that observed the failure.
        attempt: u32,
        /// Terminal token for bookkeeping.
        token: RetryToken,
    },

    /// The per-execution attempt ceiling was reached.
    #[error("request will not be retried, retries have been exhausted after attempt {attempt}")]
    MaxAttemptsReached {
        /// Attempt that observed the failure.
        attempt: u32,
        /// Terminal token for bookkeeping.
        token: RetryToken,
    },

    /// The shared capacity pool could not cover the cost of another retry.
    #[error(
        "request will not be retried to protect the caller and downstream service, \
         the cost of retrying ({cost}) exceeds the available retry capacity ({remaining}/{max})"
    )]
    CapacityExhausted {
        /// Terminal token for bookkeeping.
        token: RetryToken,
        /// Capacity the retry would have cost.
        cost: usize,
        /// Capacity left in the pool.
        remaining: usize,
        /// Upper bound of the pool.
        max: usize,
    },

    /// A token from a superseded acquire/refresh call was presented.
    #[error("retry token is stale (presented generation {presented}, latest {latest})")]
    StaleToken {
        /// Generation carried by the presented token.
        presented: u64,
        /// Latest generation issued for the execution.
        latest: u64,
    },

    /// Aggregated terminal failure built by the attempt tracker.
    ///
    /// The primary message is the final attempt's failure; every earlier
    /// attempt's message is carried in `suppressed`, labeled with its
    /// 1-based attempt index.
    #[error("{message}")]
    RetriesExhausted {
        /// Why the execution terminated.
        kind: ExhaustionKind,
        /// The final attempt's failure message.
        message: String,
        /// Prior attempts' messages, oldest first.
        suppressed: Vec<String>,
    },
}

impl RetryError {
    /// The terminal token carried by strategy-level refusals.
    pub fn token(&self) -> Option<&RetryToken> {
        match self {
            RetryError::NonRetryable { token, .. }
            | RetryError::MaxAttemptsReached { token, .. }
            | RetryError::CapacityExhausted { token, .. } => Some(token),
            RetryError::StaleToken { .. } | RetryError::RetriesExhausted { .. } => None,
        }
    }

    /// The exhaustion kind this refusal maps to, if it is a refusal.
    pub fn exhaustion_kind(&self) -> Option<ExhaustionKind> {
        match self {
            RetryError::NonRetryable { .. } => Some(ExhaustionKind::NonRetryable),
            RetryError::MaxAttemptsReached { .. } => Some(ExhaustionKind::MaxAttemptsReached),
            RetryError::CapacityExhausted { .. } => Some(ExhaustionKind::CapacityExhausted),
            RetryError::RetriesExhausted { kind, .. } => Some(*kind),
            RetryError::StaleToken { .. } => None,
        }
    }
}

/// Errors produced by the waiter executors.
#[derive(Debug, Error)]
pub enum WaiterError<E: fmt::Debug> {
    /// The polling function returned a result no acceptor recognized.
    #[error("no waiter acceptor matched the successful result after {attempts} attempts")]
    UnmatchedResult {
        /// Attempts executed, including the unmatched one.
        attempts: u32,
    },

    /// The polling function failed and no acceptor recognized the failure.
    #[error("no waiter acceptor matched the failure after {attempts} attempts: {failure:?}")]
    UnmatchedFailure {
        /// Attempts executed, including the unmatched one.
        attempts: u32,
        /// The unmatched failure.
        failure: E,
    },

    /// An acceptor classified the outcome as a terminal failure.
    #[error("waiter transitioned to failure: {message}")]
    FailureState {
        /// The acceptor's message, or a default.
        message: String,
        /// The matched failure, when the outcome was a failure.
        failure: Option<E>,
    },

    /// The configured attempt ceiling was reached while retrying.
    #[error("waiter exceeded max attempts ({attempts})")]
    ExceededMaxAttempts {
        /// Attempts executed.
        attempts: u32,
    },

    /// The next delay would cross the configured max wait deadline.
    #[error("waiter exceeded max wait time ({max_wait:?}) after {attempts} attempts")]
    ExceededMaxWaitTime {
        /// Attempts executed before the deadline check failed.
        attempts: u32,
        /// The configured deadline.
        max_wait: Duration,
    },

    /// The backoff sleep was interrupted.
    #[error("waiter sleep was interrupted")]
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_displays_primary_message() {
        let error = RetryError::RetriesExhausted {
            kind: ExhaustionKind::MaxAttemptsReached,
            message: "connection reset".to_string(),
            suppressed: vec!["attempt 1 failure: timed out".to_string()],
        };

        assert_eq!(error.to_string(), "connection reset");
        assert_eq!(
            error.exhaustion_kind(),
            Some(ExhaustionKind::MaxAttemptsReached)
        );
    }

    #[test]
    fn waiter_error_kinds_are_distinguishable() {
        let unmatched: WaiterError<&str> = WaiterError::UnmatchedResult { attempts: 2 };
        let exceeded: WaiterError<&str> = WaiterError::ExceededMaxAttempts { attempts: 3 };

        assert!(matches!(unmatched, WaiterError::UnmatchedResult { .. }));
        assert!(matches!(exceeded, WaiterError::ExceededMaxAttempts { .. }));
    }
}
