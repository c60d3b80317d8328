//! Adapter bridging the legacy policy-scoped retry contract.
//!
//! Older callers configure a [`RetryPolicy`]: a retry condition evaluated
//! against the failed attempt plus a backoff function keyed by retries
//! already attempted. [`LegacyPolicyAdapter`] lets those policies
//! participate as ordinary [`RetryStrategy`] values so the rest of the
//! machinery carries a single code path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::backoff::{BackoffStrategy, LegacyBackoffAdapter};
use crate::error::RetryError;
use crate::failure::AttemptFailure;
use crate::strategy::{RetryStrategy, RetryToken, TokenState, ensure_current};
use crate::token_bucket::TokenBucketStore;

/// Default capacity withdrawn per retried failure under a legacy policy.
pub const LEGACY_EXCEPTION_COST: usize = 5;

/// The failed attempt as seen by a legacy retry condition.
#[derive(Debug)]
pub struct RetryPolicyContext<'a> {
    /// Retries attempted so far, zero on the first failure.
    pub retries_attempted: u32,
    /// The classified failure of the attempt.
    pub failure: &'a AttemptFailure,
}

/// Legacy policy shape: a retry condition and a retries-attempted backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_condition: Arc<dyn Fn(&RetryPolicyContext<'_>) -> bool + Send + Sync>,
    delay_for_retries: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl RetryPolicy {
    /// Create a legacy policy.
    pub fn new(
        max_retries: u32,
        retry_condition: impl Fn(&RetryPolicyContext<'_>) -> bool + Send + Sync + 'static,
        delay_for_retries: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_retries,
            retry_condition: Arc::new(retry_condition),
            delay_for_retries: Arc::new(delay_for_retries),
        }
    }

    /// Maximum number of retries the policy allows.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("retry_condition", &"<fn>")
            .field("delay_for_retries", &"<fn>")
            .finish()
    }
}

/// [`RetryStrategy`] implementation backed by a legacy [`RetryPolicy`].
#[derive(Debug)]
pub struct LegacyPolicyAdapter {
    policy: RetryPolicy,
    backoff: LegacyBackoffAdapter,
    exception_cost: usize,
    token_bucket_store: Arc<TokenBucketStore>,
}

impl LegacyPolicyAdapter {
    /// Wrap a legacy policy with a private token bucket store.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_token_bucket_store(policy, Arc::new(TokenBucketStore::new()))
    }

    /// Wrap a legacy policy sharing an existing token bucket store.
    pub fn with_token_bucket_store(policy: RetryPolicy, store: Arc<TokenBucketStore>) -> Self {
        let delay_for_retries = Arc::clone(&policy.delay_for_retries);
        Self {
            backoff: LegacyBackoffAdapter::new(move |retries| delay_for_retries(retries)),
            policy,
            exception_cost: LEGACY_EXCEPTION_COST,
            token_bucket_store: store,
        }
    }
}

impl RetryStrategy for LegacyPolicyAdapter {
    fn acquire_initial_token(&self, scope: &str) -> (RetryToken, Duration) {
        let bucket = self.token_bucket_store.bucket_for_scope(scope);
        (
            RetryToken::initial(scope, bucket.current_capacity()),
            Duration::ZERO,
        )
    }

    fn refresh_token(
        &self,
        token: &RetryToken,
        failure: &AttemptFailure,
        suggested_delay: Option<Duration>,
    ) -> Result<(RetryToken, Duration), RetryError> {
        ensure_current(token)?;
        let bucket = self.token_bucket_store.bucket_for_scope(token.scope());
        let failure = failure.unwrapped();

        let context = RetryPolicyContext {
            retries_attempted: token.attempt() - 1,
            failure,
        };
        if !failure.is_retryable() || !(self.policy.retry_condition)(&context) {
            debug!(
                attempt = token.attempt(),
                "legacy policy refused to retry the failure"
            );
            return Err(RetryError::NonRetryable {
                attempt: token.attempt(),
                token: token.terminal(TokenState::NonRetryable, bucket.current_capacity()),
            });
        }

        if token.attempt() >= self.max_attempts() {
            return Err(RetryError::MaxAttemptsReached {
                attempt: token.attempt(),
                token: token.terminal(TokenState::MaxAttemptsReached, bucket.current_capacity()),
            });
        }

        let acquire = bucket.try_acquire(self.exception_cost);
        if !acquire.acquired {
            return Err(RetryError::CapacityExhausted {
                token: token.terminal(TokenState::CapacityExhausted, acquire.capacity_remaining),
                cost: acquire.capacity_requested,
                remaining: acquire.capacity_remaining,
                max: acquire.max_capacity,
            });
        }

        let next_attempt = token.attempt() + 1;
        let computed = self.backoff.compute_delay(next_attempt);
        let delay = computed.max(suggested_delay.unwrap_or(Duration::ZERO));

        let refreshed = token.advanced(&acquire, delay);
        debug!(
            attempt = refreshed.attempt(),
            backoff_ms = delay.as_millis() as u64,
            capacity = acquire.capacity_remaining,
            "legacy policy permitted retry"
        );
        Ok((refreshed, delay))
    }

    fn record_success(&self, token: &RetryToken) -> Result<RetryToken, RetryError> {
        ensure_current(token)?;
        let bucket = self.token_bucket_store.bucket_for_scope(token.scope());
        let release = bucket.release(token.capacity_acquired().max(1));
        Ok(token.succeeded(release.current_capacity))
    }

    fn max_attempts(&self) -> u32 {
        self.policy.max_retries + 1
    }

    /// Legacy three-field diagnostic header:
    /// `<retries>/<last backoff millis>/<remaining capacity>`.
    fn retry_info_header(&self, token: &RetryToken) -> String {
        format!(
            "{}/{}/{}",
            token.attempt().saturating_sub(1),
            token.last_delay().as_millis(),
            token.capacity_remaining()
        )
    }
}
