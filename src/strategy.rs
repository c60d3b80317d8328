//! Retry tokens and the strategies that gate whether an attempt may proceed.
//!
//! A strategy hands out one token per logical execution. Each permitted
//! retry refreshes the token; success returns capacity to the shared pool.
//! Refusals fail with a [`RetryError`] carrying the terminal token so the
//! caller can still read attempt and capacity bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::backoff::{Backoff, BackoffStrategy, ExponentialDelayWithJitter};
use crate::error::RetryError;
use crate::failure::AttemptFailure;
use crate::token_bucket::{AcquireOutcome, TokenBucketStore};

/// Default per-execution attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default capacity withdrawn from the shared pool per retried failure.
pub const DEFAULT_EXCEPTION_COST: usize = 5;

/// State a retry token can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// The execution is still attempting.
    InProgress,
    /// The execution finished successfully.
    Succeeded,
    /// Retries stopped at the attempt ceiling.
    MaxAttemptsReached,
    /// Retries stopped on a non-retryable failure.
    NonRetryable,
    /// Retries stopped because the capacity pool was drained.
    CapacityExhausted,
}

/// Permission unit for one logical execution.
///
/// Tokens form a lineage: every refresh produces a descendant tagged with
/// the next generation, and strategies reject tokens from superseded
/// generations. Cloning a token does not fork the lineage.
#[derive(Debug, Clone)]
pub struct RetryToken {
    scope: String,
    attempt: u32,
    state: TokenState,
    generation: u64,
    lineage: Arc<AtomicU64>,
    capacity_acquired: usize,
    capacity_remaining: usize,
    last_delay: Duration,
}

impl RetryToken {
    pub(crate) fn initial(scope: &str, capacity_remaining: usize) -> Self {
        Self {
            scope: scope.to_owned(),
            attempt: 1,
            state: TokenState::InProgress,
            generation: 0,
            lineage: Arc::new(AtomicU64::new(0)),
            capacity_acquired: 0,
            capacity_remaining,
            last_delay: Duration::ZERO,
        }
    }

    /// Scope this token was acquired for.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Attempt number this token authorizes, 1-indexed.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current state of the token.
    pub fn state(&self) -> TokenState {
        self.state
    }

    /// Capacity withdrawn by the most recent refresh.
    pub fn capacity_acquired(&self) -> usize {
        self.capacity_acquired
    }

    /// Pool capacity observed at the most recent strategy call.
    pub fn capacity_remaining(&self) -> usize {
        self.capacity_remaining
    }

    /// Backoff delay computed by the most recent refresh.
    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }

    pub(crate) fn is_current(&self) -> bool {
        self.generation == self.lineage.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn latest_generation(&self) -> u64 {
        self.lineage.load(Ordering::Acquire)
    }

    /// Next-generation descendant after a permitted retry.
    pub(crate) fn advanced(&self, acquire: &AcquireOutcome, delay: Duration) -> Self {
        let generation = self.lineage.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            scope: self.scope.clone(),
            attempt: self.attempt + 1,
            state: TokenState::InProgress,
            generation,
            lineage: Arc::clone(&self.lineage),
            capacity_acquired: acquire.capacity_acquired,
            capacity_remaining: acquire.capacity_remaining,
            last_delay: delay,
        }
    }

    /// Next-generation descendant after a recorded success.
    pub(crate) fn succeeded(&self, capacity_remaining: usize) -> Self {
        let generation = self.lineage.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            scope: self.scope.clone(),
            attempt: self.attempt,
            state: TokenState::Succeeded,
            generation,
            lineage: Arc::clone(&self.lineage),
            capacity_acquired: self.capacity_acquired,
            capacity_remaining,
            last_delay: self.last_delay,
        }
    }

    /// Same-generation copy carrying a terminal state, used in refusals.
    pub(crate) fn terminal(&self, state: TokenState, capacity_remaining: usize) -> Self {
        Self {
            scope: self.scope.clone(),
            attempt: self.attempt,
            state,
            generation: self.generation,
            lineage: Arc::clone(&self.lineage),
            capacity_acquired: self.capacity_acquired,
            capacity_remaining,
            last_delay: self.last_delay,
        }
    }
}

pub(crate) fn ensure_current(token: &RetryToken) -> Result<(), RetryError> {
    if token.is_current() {
        Ok(())
    } else {
        Err(RetryError::StaleToken {
            presented: token.generation(),
            latest: token.latest_generation(),
        })
    }
}

/// Capability that gates retry attempts and supplies their backoff delay.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Acquire the token for a new logical execution.
    ///
    /// Returns the token together with the delay to impose before the first
    /// attempt, usually zero.
    fn acquire_initial_token(&self, scope: &str) -> (RetryToken, Duration);

    /// Ask for permission to retry after a failed attempt.
    ///
    /// On success, returns the refreshed token and the delay to impose
    /// before the next attempt, never less than `suggested_delay`. Fails
    /// with a token-bearing [`RetryError`] when the retry is refused, or
    /// [`RetryError::StaleToken`] when `token` is not the latest in its
    /// lineage.
    fn refresh_token(
        &self,
        token: &RetryToken,
        failure: &AttemptFailure,
        suggested_delay: Option<Duration>,
    ) -> Result<(RetryToken, Duration), RetryError>;

    /// Record a successful attempt, crediting the shared capacity pool.
    fn record_success(&self, token: &RetryToken) -> Result<RetryToken, RetryError>;

    /// Per-execution attempt ceiling.
    fn max_attempts(&self) -> u32;

    /// Diagnostic header value describing the retry state of an attempt.
    fn retry_info_header(&self, token: &RetryToken) -> String {
        format!("attempt={}; max={}", token.attempt(), self.max_attempts())
    }
}

/// Standard retry strategy: attempt ceiling, backoff, shared token bucket.
///
/// Refusal checks run in a fixed order: non-retryable classification, then
/// the attempt ceiling, then pool capacity.
#[derive(Debug)]
pub struct StandardRetryStrategy {
    max_attempts: u32,
    backoff: Backoff,
    throttling_backoff: Backoff,
    exception_cost: usize,
    circuit_breaker_enabled: bool,
    token_bucket_store: Arc<TokenBucketStore>,
}

impl StandardRetryStrategy {
    /// Create a builder with default settings.
    pub fn builder() -> StandardRetryStrategyBuilder {
        StandardRetryStrategyBuilder::default()
    }

    /// The shared token bucket store backing this strategy.
    pub fn token_bucket_store(&self) -> &Arc<TokenBucketStore> {
        &self.token_bucket_store
    }

    fn exception_cost(&self) -> usize {
        if self.circuit_breaker_enabled {
            self.exception_cost
        } else {
            0
        }
    }
}

impl Default for StandardRetryStrategy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryStrategy for StandardRetryStrategy {
    fn acquire_initial_token(&self, scope: &str) -> (RetryToken, Duration) {
        let bucket = self.token_bucket_store.bucket_for_scope(scope);
        debug!(
            scope,
            capacity = bucket.current_capacity(),
            max = bucket.max_capacity(),
            "request attempt 1 token acquired (backoff: 0ms, cost: 0)"
        );
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

        if !failure.is_retryable() {
            debug!(
                attempt = token.attempt(),
                "request attempt encountered non-retryable failure"
            );
            return Err(RetryError::NonRetryable {
                attempt: token.attempt(),
                token: token.terminal(TokenState::NonRetryable, bucket.current_capacity()),
            });
        }
        debug!(
            attempt = token.attempt(),
            "request attempt encountered retryable failure"
        );

        if token.attempt() >= self.max_attempts {
            return Err(RetryError::MaxAttemptsReached {
                attempt: token.attempt(),
                token: token.terminal(TokenState::MaxAttemptsReached, bucket.current_capacity()),
            });
        }

        let acquire = bucket.try_acquire(self.exception_cost());
        if !acquire.acquired {
            return Err(RetryError::CapacityExhausted {
                token: token.terminal(TokenState::CapacityExhausted, acquire.capacity_remaining),
                cost: acquire.capacity_requested,
                remaining: acquire.capacity_remaining,
                max: acquire.max_capacity,
            });
        }

        let next_attempt = token.attempt() + 1;
        let computed = if failure.is_throttling() {
            self.throttling_backoff.compute_delay(next_attempt)
        } else {
            self.backoff.compute_delay(next_attempt)
        };
        let delay = computed.max(suggested_delay.unwrap_or(Duration::ZERO));

        let refreshed = token.advanced(&acquire, delay);
        debug!(
            attempt = refreshed.attempt(),
            backoff_ms = delay.as_millis() as u64,
            cost = acquire.capacity_acquired,
            capacity = acquire.capacity_remaining,
            max = acquire.max_capacity,
            "retry token acquired"
        );
        Ok((refreshed, delay))
    }

    fn record_success(&self, token: &RetryToken) -> Result<RetryToken, RetryError> {
        ensure_current(token)?;
        let bucket = self.token_bucket_store.bucket_for_scope(token.scope());
        // Release at least one unit so a drained bucket can replenish even
        // when the succeeding attempt acquired nothing.
        let release = bucket.release(token.capacity_acquired().max(1));
        debug!(
            attempt = token.attempt(),
            released = release.capacity_released,
            capacity = release.current_capacity,
            max = release.max_capacity,
            "request attempt succeeded"
        );
        Ok(token.succeeded(release.current_capacity))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Builder for [`StandardRetryStrategy`].
#[derive(Debug, Default)]
pub struct StandardRetryStrategyBuilder {
    max_attempts: Option<u32>,
    backoff: Option<Backoff>,
    throttling_backoff: Option<Backoff>,
    exception_cost: Option<usize>,
    circuit_breaker_enabled: Option<bool>,
    token_bucket_store: Option<Arc<TokenBucketStore>>,
}

impl StandardRetryStrategyBuilder {
    /// Set the per-execution attempt ceiling.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the backoff strategy for non-throttling failures.
    pub fn backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.backoff = Some(backoff.into());
        self
    }

    /// Set the backoff strategy for throttling failures.
    pub fn throttling_backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.throttling_backoff = Some(backoff.into());
        self
    }

    /// Set the capacity cost of each retried failure.
    pub fn exception_cost(mut self, cost: usize) -> Self {
        self.exception_cost = Some(cost);
        self
    }

    /// Enable or disable the shared-capacity circuit breaker.
    ///
    /// Disabling it keeps every other gate but makes retries cost nothing.
    pub fn circuit_breaker_enabled(mut self, enabled: bool) -> Self {
        self.circuit_breaker_enabled = Some(enabled);
        self
    }

    /// Share a token bucket store with other strategies.
    pub fn token_bucket_store(mut self, store: Arc<TokenBucketStore>) -> Self {
        self.token_bucket_store = Some(store);
        self
    }

    /// Build the strategy.
    pub fn build(self) -> StandardRetryStrategy {
        StandardRetryStrategy {
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff: self
                .backoff
                .unwrap_or_else(|| ExponentialDelayWithJitter::default().into()),
            throttling_backoff: self.throttling_backoff.unwrap_or_else(|| {
                ExponentialDelayWithJitter::default()
                    .base_delay(Duration::from_millis(500))
                    .into()
            }),
            exception_cost: self.exception_cost.unwrap_or(DEFAULT_EXCEPTION_COST),
            circuit_breaker_enabled: self.circuit_breaker_enabled.unwrap_or(true),
            token_bucket_store: self
                .token_bucket_store
                .unwrap_or_else(|| Arc::new(TokenBucketStore::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{FixedDelay, RetryImmediately};
    use crate::token_bucket::TokenBucketStore;

    fn strategy_with(store: Arc<TokenBucketStore>) -> StandardRetryStrategy {
        StandardRetryStrategy::builder()
            .max_attempts(3)
            .backoff(RetryImmediately::new())
            .throttling_backoff(FixedDelay::new(Duration::from_millis(750)))
            .token_bucket_store(store)
            .build()
    }

    #[test]
    fn initial_token_authorizes_attempt_one_with_zero_delay() {
        let strategy = StandardRetryStrategy::default();

        let (token, delay) = strategy.acquire_initial_token("s3");
        assert_eq!(token.attempt(), 1);
        assert_eq!(token.state(), TokenState::InProgress);
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn refresh_increments_attempt_and_withdraws_capacity() {
        let store = Arc::new(TokenBucketStore::with_bucket_capacity(100));
        let strategy = strategy_with(Arc::clone(&store));

        let (token, _) = strategy.acquire_initial_token("s3");
        let (refreshed, delay) = strategy
            .refresh_token(&token, &AttemptFailure::transient("timeout"), None)
            .expect("retry should be permitted");

        assert_eq!(refreshed.attempt(), 2);
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(refreshed.capacity_acquired(), DEFAULT_EXCEPTION_COST);
        assert_eq!(
            store.bucket_for_scope("s3").current_capacity(),
            100 - DEFAULT_EXCEPTION_COST
        );
    }

    #[test]
    fn non_retryable_failure_is_refused_before_any_withdrawal() {
        let store = Arc::new(TokenBucketStore::with_bucket_capacity(100));
        let strategy = strategy_with(Arc::clone(&store));

        let (token, _) = strategy.acquire_initial_token("s3");
        let error = strategy
            .refresh_token(&token, &AttemptFailure::non_retryable("denied"), None)
            .expect_err("non-retryable must refuse");

        assert!(matches!(error, RetryError::NonRetryable { .. }));
        assert_eq!(store.bucket_for_scope("s3").current_capacity(), 100);
    }

    #[test]
    fn max_attempts_gate_fires_before_capacity_withdrawal() {
        let store = Arc::new(TokenBucketStore::with_bucket_capacity(100));
        let strategy = strategy_with(Arc::clone(&store));
        let failure = AttemptFailure::transient("timeout");

        let (token, _) = strategy.acquire_initial_token("s3");
        let (token, _) = strategy.refresh_token(&token, &failure, None).unwrap();
        let (token, _) = strategy.refresh_token(&token, &failure, None).unwrap();

        let error = strategy
            .refresh_token(&token, &failure, None)
            .expect_err("third refresh exceeds max_attempts=3");
        assert!(matches!(error, RetryError::MaxAttemptsReached { .. }));
        assert_eq!(error.token().unwrap().attempt(), 3);
        // Only the two permitted retries withdrew capacity.
        assert_eq!(
            store.bucket_for_scope("s3").current_capacity(),
            100 - 2 * DEFAULT_EXCEPTION_COST
        );
    }

    #[test]
    fn drained_bucket_refuses_with_capacity_exhausted() {
        let store = Arc::new(TokenBucketStore::with_bucket_capacity(
            DEFAULT_EXCEPTION_COST - 1,
        ));
        let strategy = strategy_with(store);

        let (token, _) = strategy.acquire_initial_token("s3");
        let error = strategy
            .refresh_token(&token, &AttemptFailure::transient("timeout"), None)
            .expect_err("bucket cannot cover the cost");

        match error {
            RetryError::CapacityExhausted { cost, remaining, max, .. } => {
                assert_eq!(cost, DEFAULT_EXCEPTION_COST);
                assert_eq!(remaining, DEFAULT_EXCEPTION_COST - 1);
                assert_eq!(max, DEFAULT_EXCEPTION_COST - 1);
            }
            other => panic!("expected CapacityExhausted, got {other:?}"),
        }
    }

    #[test]
    fn throttling_failures_use_the_throttling_backoff() {
        let strategy = strategy_with(Arc::new(TokenBucketStore::new()));

        let (token, _) = strategy.acquire_initial_token("s3");
        let (_, delay) = strategy
            .refresh_token(&token, &AttemptFailure::throttling("slow down"), None)
            .unwrap();

        assert_eq!(delay, Duration::from_millis(750));
    }

    #[test]
    fn suggested_delay_wins_when_larger() {
        let strategy = strategy_with(Arc::new(TokenBucketStore::new()));
        let failure = AttemptFailure::transient("timeout");

        let (token, _) = strategy.acquire_initial_token("s3");
        let (_token, delay) = strategy
            .refresh_token(&token, &failure, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(delay, Duration::from_secs(2));

        // Smaller suggestions lose to the computed backoff.
        let strategy = StandardRetryStrategy::builder()
            .max_attempts(5)
            .backoff(FixedDelay::new(Duration::from_secs(3)))
            .build();
        let (token, _) = strategy.acquire_initial_token("s3");
        let (_, delay) = strategy
            .refresh_token(&token, &failure, Some(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(delay, Duration::from_secs(3));
    }

    #[test]
    fn success_releases_at_least_one_unit() {
        let store = Arc::new(TokenBucketStore::with_bucket_capacity(10));
        let strategy = StandardRetryStrategy::builder()
            .circuit_breaker_enabled(false)
            .backoff(RetryImmediately::new())
            .token_bucket_store(Arc::clone(&store))
            .build();

        let bucket = store.bucket_for_scope("s3");
        assert!(bucket.try_acquire(10).acquired);

        let (token, _) = strategy.acquire_initial_token("s3");
        // Disabled circuit breaker means the retry acquired zero capacity.
        let (token, _) = strategy
            .refresh_token(&token, &AttemptFailure::transient("timeout"), None)
            .unwrap();
        let succeeded = strategy.record_success(&token).unwrap();

        assert_eq!(succeeded.state(), TokenState::Succeeded);
        assert_eq!(bucket.current_capacity(), 1);
    }

    #[test]
    fn stale_tokens_are_rejected() {
        let strategy = strategy_with(Arc::new(TokenBucketStore::new()));
        let failure = AttemptFailure::transient("timeout");

        let (token, _) = strategy.acquire_initial_token("s3");
        let superseded = token.clone();
        let (_current, _) = strategy.refresh_token(&token, &failure, None).unwrap();

        let error = strategy
            .refresh_token(&superseded, &failure, None)
            .expect_err("superseded token must be rejected");
        assert!(matches!(error, RetryError::StaleToken { .. }));

        let error = strategy
            .record_success(&superseded)
            .expect_err("superseded token must be rejected");
        assert!(matches!(error, RetryError::StaleToken { .. }));
    }

    #[test]
    fn wrapped_failures_are_classified_by_their_cause() {
        let strategy = strategy_with(Arc::new(TokenBucketStore::new()));

        let (token, _) = strategy.acquire_initial_token("s3");
        let wrapped =
            AttemptFailure::wrapped(AttemptFailure::wrapped(AttemptFailure::non_retryable("no")));
        let error = strategy
            .refresh_token(&token, &wrapped, None)
            .expect_err("cause is non-retryable");
        assert!(matches!(error, RetryError::NonRetryable { .. }));
    }

    #[test]
    fn default_header_reports_attempt_and_ceiling() {
        let strategy = strategy_with(Arc::new(TokenBucketStore::new()));

        let (token, _) = strategy.acquire_initial_token("s3");
        assert_eq!(strategy.retry_info_header(&token), "attempt=1; max=3");
    }
}
