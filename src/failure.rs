//! Classified attempt failures handed to the retry layer.
//!
//! Classification itself happens outside this crate; the caller's failure
//! classifier decides whether an error is transient, throttling, or not
//! retryable, and this module carries that verdict through the retry
//! machinery. Failures surfaced through an async completion wrapper can be
//! nested arbitrarily deep and are unwrapped before classification is read.

use std::error::Error as StdError;
use std::fmt;

/// Verdict of the external failure classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure, consumes retry budget.
    Transient,
    /// Throttling response from the service, retried with its own backoff.
    Throttling,
    /// Failure that must never be retried.
    NonRetryable,
}

/// A single attempt's failure, as classified by the caller.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    /// A failure with a classification verdict and message.
    Classified {
        /// The classifier's verdict.
        class: ErrorClass,
        /// Human-readable description of the failure.
        message: String,
    },
    /// A failure wrapped by an async completion layer.
    Wrapped(Box<AttemptFailure>),
}

impl AttemptFailure {
    /// A transient, retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Classified {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    /// A throttling failure.
    pub fn throttling(message: impl Into<String>) -> Self {
        Self::Classified {
            class: ErrorClass::Throttling,
            message: message.into(),
        }
    }

    /// A failure that must not be retried.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::Classified {
            class: ErrorClass::NonRetryable,
            message: message.into(),
        }
    }

    /// Wrap a failure the way an async completion layer would.
    pub fn wrapped(inner: AttemptFailure) -> Self {
        Self::Wrapped(Box::new(inner))
    }

    /// Strip completion wrappers until the underlying failure is reached.
    pub fn unwrapped(&self) -> &AttemptFailure {
        let mut failure = self;
        while let AttemptFailure::Wrapped(inner) = failure {
            failure = inner.as_ref();
        }
        failure
    }

    /// Classification of the underlying failure.
    pub fn class(&self) -> ErrorClass {
        match self.unwrapped() {
            AttemptFailure::Classified { class, .. } => *class,
            AttemptFailure::Wrapped(_) => unreachable!("unwrapped returned a wrapper"),
        }
    }

    /// Message of the underlying failure.
    pub fn message(&self) -> &str {
        match self.unwrapped() {
            AttemptFailure::Classified { message, .. } => message,
            AttemptFailure::Wrapped(_) => unreachable!("unwrapped returned a wrapper"),
        }
    }

    /// Whether the failure may consume retry budget.
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::NonRetryable
    }

    /// Whether the failure was classified as throttling.
    pub fn is_throttling(&self) -> bool {
        self.class() == ErrorClass::Throttling
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl StdError for AttemptFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_read_through_wrappers() {
        let failure = AttemptFailure::wrapped(AttemptFailure::wrapped(AttemptFailure::throttling(
            "slow down",
        )));

        assert_eq!(failure.class(), ErrorClass::Throttling);
        assert_eq!(failure.message(), "slow down");
        assert!(failure.is_retryable());
        assert!(failure.is_throttling());
    }

    #[test]
    fn non_retryable_is_detected() {
        let failure = AttemptFailure::non_retryable("access denied");

        assert!(!failure.is_retryable());
        assert_eq!(failure.to_string(), "access denied");
    }
}
