//! Backoff strategies controlling the delay imposed before a retry attempt.
//!
//! Every strategy maps a 1-indexed attempt number to a non-negative delay.
//! Jittered strategies consult a random source but never block and never
//! produce a negative duration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

/// Trait for backoff strategies that compute the delay before a retry.
pub trait BackoffStrategy {
    /// Compute the delay before the given attempt, using the provided RNG.
    ///
    /// `attempt` is 1-indexed: attempt 1 is the initial attempt, attempt 2
    /// is the first retry. Passing a seeded RNG makes jittered strategies
    /// deterministic for testing.
    fn compute_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration;

    /// Compute the delay before the given attempt with an OS-seeded RNG.
    fn compute_delay(&self, attempt: u32) -> Duration {
        let mut rng = SmallRng::from_os_rng();
        self.compute_delay_with_rng(attempt, &mut rng)
    }
}

/// Backoff strategy that waits the same fixed delay before every retry.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use patience::backoff::{BackoffStrategy, FixedDelay};
///
/// let backoff = FixedDelay::new(Duration::from_secs(5));
/// assert_eq!(backoff.compute_delay(1), Duration::from_secs(5));
/// assert_eq!(backoff.compute_delay(7), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    /// Create a fixed-delay backoff with the given delay.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// The configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl BackoffStrategy for FixedDelay {
    fn compute_delay_with_rng<R: Rng>(&self, _attempt: u32, _rng: &mut R) -> Duration {
        self.delay
    }
}

/// Backoff strategy that retries without any delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryImmediately;

impl RetryImmediately {
    /// Create a zero-delay backoff.
    pub fn new() -> Self {
        Self
    }
}

impl BackoffStrategy for RetryImmediately {
    fn compute_delay_with_rng<R: Rng>(&self, _attempt: u32, _rng: &mut R) -> Duration {
        Duration::ZERO
    }
}

/// Exponential backoff with configurable jitter.
///
/// Delays grow as `base_delay * multiplier^(attempt-1)`, capped at
/// `max_delay`, then scaled by the jitter blend
/// `1 - jitter_factor + random * jitter_factor`.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use patience::backoff::ExponentialDelayWithJitter;
///
/// let backoff = ExponentialDelayWithJitter::new()
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(20))
///     .jitter_factor(1.0); // full jitter
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ExponentialDelayWithJitter {
    /// Delay before the first retry, prior to jitter.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    pub jitter_factor: f64,
}

impl ExponentialDelayWithJitter {
    /// Create an exponential backoff with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay cap.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter factor (clamped to `0.0..=1.0`).
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }
}

impl Default for ExponentialDelayWithJitter {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            multiplier: 2.0,
            jitter_factor: 1.0,
        }
    }
}

impl BackoffStrategy for ExponentialDelayWithJitter {
    fn compute_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let grown = (self.base_delay.as_millis() as f64) * self.multiplier.powi(exponent);
        let capped = grown.min(self.max_delay.as_millis() as f64);

        let random_scalar: f64 = rng.random_range(0.0..=1.0);
        let jitter_blend = 1.0 - jitter_factor + random_scalar * jitter_factor;
        let jittered = capped * jitter_blend;

        Duration::from_millis(jittered as u64)
    }
}

/// Adapter wrapping the legacy policy-scoped backoff function.
///
/// The legacy contract computes a delay from the number of retries already
/// attempted rather than from the attempt number. The adapter translates
/// `attempt` into `attempt - 2` retries attempted, so attempts 1 and 2 both
/// map to zero retries attempted, matching the historical contract.
#[derive(Clone)]
pub struct LegacyBackoffAdapter {
    delay_for_retries: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl LegacyBackoffAdapter {
    /// Wrap a legacy `retries attempted -> delay` function.
    pub fn new(delay_for_retries: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self {
            delay_for_retries: Arc::new(delay_for_retries),
        }
    }
}

impl BackoffStrategy for LegacyBackoffAdapter {
    fn compute_delay_with_rng<R: Rng>(&self, attempt: u32, _rng: &mut R) -> Duration {
        let retries_attempted = attempt.saturating_sub(2);
        (self.delay_for_retries)(retries_attempted)
    }
}

impl fmt::Debug for LegacyBackoffAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyBackoffAdapter")
            .field("delay_for_retries", &"<fn>")
            .finish()
    }
}

/// Backoff strategy that can represent any supported variant.
///
/// The enum form makes it possible to store heterogeneous strategies in
/// configuration without dynamic dispatch.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay before every retry.
    Fixed(FixedDelay),
    /// No delay before retries.
    Immediate(RetryImmediately),
    /// Exponential growth with jitter.
    Exponential(ExponentialDelayWithJitter),
    /// Legacy retries-attempted contract.
    Legacy(LegacyBackoffAdapter),
}

impl BackoffStrategy for Backoff {
    fn compute_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        match self {
            Backoff::Fixed(strategy) => strategy.compute_delay_with_rng(attempt, rng),
            Backoff::Immediate(strategy) => strategy.compute_delay_with_rng(attempt, rng),
            Backoff::Exponential(strategy) => strategy.compute_delay_with_rng(attempt, rng),
            Backoff::Legacy(strategy) => strategy.compute_delay_with_rng(attempt, rng),
        }
    }
}

impl From<FixedDelay> for Backoff {
    fn from(value: FixedDelay) -> Self {
        Backoff::Fixed(value)
    }
}

impl From<RetryImmediately> for Backoff {
    fn from(value: RetryImmediately) -> Self {
        Backoff::Immediate(value)
    }
}

impl From<ExponentialDelayWithJitter> for Backoff {
    fn from(value: ExponentialDelayWithJitter) -> Self {
        Backoff::Exponential(value)
    }
}

impl From<LegacyBackoffAdapter> for Backoff {
    fn from(value: LegacyBackoffAdapter) -> Self {
        Backoff::Legacy(value)
    }
}
