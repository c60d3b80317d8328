//! Adaptive retry strategy shaped by observed throttling feedback.
//!
//! The adaptive strategy layers a per-scope throttle signal on top of the
//! standard gates. Throttled failures strengthen the signal, successes and
//! elapsed time weaken it, and while it is raised both retries and brand-new
//! executions in that scope are slowed down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::RetryError;
use crate::failure::AttemptFailure;
use crate::strategy::{RetryStrategy, RetryToken, StandardRetryStrategy, StandardRetryStrategyBuilder};
use crate::token_bucket::TokenBucketStore;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);
const DEFAULT_WARMUP_UNIT: Duration = Duration::from_millis(250);
const MAX_SIGNAL_STRENGTH: f64 = 8.0;
const SIGNAL_FLOOR: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
struct ThrottleSignal {
    strength: f64,
    observed_at: Instant,
}

/// Retry strategy whose delays adapt to observed throttling.
///
/// Delegates the gate checks to a [`StandardRetryStrategy`] and adds a
/// throttle-derived delay on top of the computed backoff. New executions in
/// a recently throttled scope receive a warm-up delay from
/// [`RetryStrategy::acquire_initial_token`].
#[derive(Debug)]
pub struct AdaptiveRetryStrategy {
    base: StandardRetryStrategy,
    cooldown: Duration,
    warmup_unit: Duration,
    signals: Mutex<HashMap<String, ThrottleSignal>>,
}

impl AdaptiveRetryStrategy {
    /// Create a builder with default settings.
    pub fn builder() -> AdaptiveRetryStrategyBuilder {
        AdaptiveRetryStrategyBuilder::default()
    }

    fn decayed_strength(&self, signal: &ThrottleSignal, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(signal.observed_at);
        let halvings = elapsed.as_secs_f64() / self.cooldown.as_secs_f64();
        signal.strength * 0.5f64.powf(halvings)
    }

    fn record_throttle(&self, scope: &str) {
        let now = Instant::now();
        let mut signals = self.signals.lock().expect("throttle signal state poisoned");
        let strength = signals
            .get(scope)
            .map(|signal| self.decayed_strength(signal, now))
            .unwrap_or(0.0);
        let strength = (strength + 1.0).min(MAX_SIGNAL_STRENGTH);
        debug!(scope, strength, "throttling observed, raising send-rate cushion");
        signals.insert(
            scope.to_owned(),
            ThrottleSignal {
                strength,
                observed_at: now,
            },
        );
    }

    fn weaken_signal(&self, scope: &str) {
        let now = Instant::now();
        let mut signals = self.signals.lock().expect("throttle signal state poisoned");
        if let Some(signal) = signals.get(scope).copied() {
            let strength = self.decayed_strength(&signal, now) * 0.5;
            if strength < SIGNAL_FLOOR {
                signals.remove(scope);
            } else {
                signals.insert(
                    scope.to_owned(),
                    ThrottleSignal {
                        strength,
                        observed_at: now,
                    },
                );
            }
        }
    }

    fn current_delay(&self, scope: &str) -> Duration {
        let now = Instant::now();
        let signals = self.signals.lock().expect("throttle signal state poisoned");
        match signals.get(scope) {
            Some(signal) => {
                let strength = self.decayed_strength(signal, now);
                if strength < SIGNAL_FLOOR {
                    Duration::ZERO
                } else {
                    self.warmup_unit.mul_f64(strength.min(MAX_SIGNAL_STRENGTH))
                }
            }
            None => Duration::ZERO,
        }
    }
}

impl RetryStrategy for AdaptiveRetryStrategy {
    fn acquire_initial_token(&self, scope: &str) -> (RetryToken, Duration) {
        let (token, _) = self.base.acquire_initial_token(scope);
        let warmup = self.current_delay(scope);
        if !warmup.is_zero() {
            debug!(scope, warmup_ms = warmup.as_millis() as u64, "scope under load, delaying first attempt");
        }
        (token, warmup)
    }

    fn refresh_token(
        &self,
        token: &RetryToken,
        failure: &AttemptFailure,
        suggested_delay: Option<Duration>,
    ) -> Result<(RetryToken, Duration), RetryError> {
        let (refreshed, delay) = self.base.refresh_token(token, failure, suggested_delay)?;
        if failure.is_throttling() {
            self.record_throttle(refreshed.scope());
        }
        let adaptive_delay = self.current_delay(refreshed.scope());
        Ok((refreshed, delay + adaptive_delay))
    }

    fn record_success(&self, token: &RetryToken) -> Result<RetryToken, RetryError> {
        let succeeded = self.base.record_success(token)?;
        self.weaken_signal(succeeded.scope());
        Ok(succeeded)
    }

    fn max_attempts(&self) -> u32 {
        self.base.max_attempts()
    }
}

/// Builder for [`AdaptiveRetryStrategy`].
#[derive(Debug, Default)]
pub struct AdaptiveRetryStrategyBuilder {
    base: StandardRetryStrategyBuilder,
    cooldown: Option<Duration>,
    warmup_unit: Option<Duration>,
}

impl AdaptiveRetryStrategyBuilder {
    /// Set the per-execution attempt ceiling.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.base = self.base.max_attempts(max_attempts);
        self
    }

    /// Set the backoff strategy for non-throttling failures.
    pub fn backoff(mut self, backoff: impl Into<crate::backoff::Backoff>) -> Self {
        self.base = self.base.backoff(backoff);
        self
    }

    /// Set the backoff strategy for throttling failures.
    pub fn throttling_backoff(mut self, backoff: impl Into<crate::backoff::Backoff>) -> Self {
        self.base = self.base.throttling_backoff(backoff);
        self
    }

    /// Set the capacity cost of each retried failure.
    pub fn exception_cost(mut self, cost: usize) -> Self {
        self.base = self.base.exception_cost(cost);
        self
    }

    /// Enable or disable the shared-capacity circuit breaker.
    pub fn circuit_breaker_enabled(mut self, enabled: bool) -> Self {
        self.base = self.base.circuit_breaker_enabled(enabled);
        self
    }

    /// Share a token bucket store with other strategies.
    pub fn token_bucket_store(mut self, store: Arc<TokenBucketStore>) -> Self {
        self.base = self.base.token_bucket_store(store);
        self
    }

    /// Set how long a throttle observation takes to halve.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Set the delay contributed per unit of throttle-signal strength.
    pub fn warmup_unit(mut self, unit: Duration) -> Self {
        self.warmup_unit = Some(unit);
        self
    }

    /// Build the strategy.
    pub fn build(self) -> AdaptiveRetryStrategy {
        AdaptiveRetryStrategy {
            base: self.base.build(),
            cooldown: self.cooldown.unwrap_or(DEFAULT_COOLDOWN),
            warmup_unit: self.warmup_unit.unwrap_or(DEFAULT_WARMUP_UNIT),
            signals: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryImmediately;

    fn adaptive() -> AdaptiveRetryStrategy {
        AdaptiveRetryStrategy::builder()
            .max_attempts(5)
            .backoff(RetryImmediately::new())
            .throttling_backoff(RetryImmediately::new())
            // Long cooldown keeps the signal effectively constant in tests.
            .cooldown(Duration::from_secs(3600))
            .warmup_unit(Duration::from_millis(250))
            .build()
    }

    #[test]
    fn calm_scope_gets_zero_initial_delay() {
        let strategy = adaptive();

        let (_, delay) = strategy.acquire_initial_token("kinesis");
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn throttled_scope_imposes_warmup_on_new_executions() {
        let strategy = adaptive();

        let (token, _) = strategy.acquire_initial_token("kinesis");
        let (_, retry_delay) = strategy
            .refresh_token(&token, &AttemptFailure::throttling("slow down"), None)
            .unwrap();
        assert_eq!(retry_delay, Duration::from_millis(250));

        let (_, warmup) = strategy.acquire_initial_token("kinesis");
        assert_eq!(warmup, Duration::from_millis(250));

        // Unrelated scopes are unaffected.
        let (_, other) = strategy.acquire_initial_token("sqs");
        assert_eq!(other, Duration::ZERO);
    }

    #[test]
    fn repeated_throttling_strengthens_the_signal() {
        let strategy = adaptive();
        let throttle = AttemptFailure::throttling("slow down");

        let (token, _) = strategy.acquire_initial_token("kinesis");
        let (token, first) = strategy.refresh_token(&token, &throttle, None).unwrap();
        let (_token, second) = strategy.refresh_token(&token, &throttle, None).unwrap();

        assert!(second > first);
    }

    #[test]
    fn success_weakens_the_signal() {
        let strategy = adaptive();

        let (token, _) = strategy.acquire_initial_token("kinesis");
        let (token, _) = strategy
            .refresh_token(&token, &AttemptFailure::throttling("slow down"), None)
            .unwrap();
        let before = strategy.current_delay("kinesis");

        strategy.record_success(&token).unwrap();
        let after = strategy.current_delay("kinesis");

        assert!(after < before);
    }

    #[test]
    fn transient_failures_do_not_raise_the_signal() {
        let strategy = adaptive();

        let (token, _) = strategy.acquire_initial_token("kinesis");
        let (_, delay) = strategy
            .refresh_token(&token, &AttemptFailure::transient("timeout"), None)
            .unwrap();

        assert_eq!(delay, Duration::ZERO);
        assert_eq!(strategy.current_delay("kinesis"), Duration::ZERO);
    }
}
