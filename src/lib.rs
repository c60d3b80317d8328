//! patience - retry strategies and polling waiters for service clients
//!
//! This crate is the resilience layer of a client talking to a remote
//! service: it decides whether each failed attempt may be retried, how long
//! to wait before retrying, and provides a generalized "poll until a
//! terminal condition is observed" waiter built on the same backoff and
//! timeout vocabulary.
//!
//! # Features
//!
//! - **Token-bucket circuit breaking**: concurrent executions share a
//!   lock-free capacity pool, so a burst of failures cannot retry
//!   unboundedly
//! - **Attempt tracking**: per-execution bookkeeping with an aggregated
//!   final error carrying every prior attempt's failure
//! - **Waiters**: ordered acceptor lists with first-match-wins semantics,
//!   in blocking and async flavors
//! - **Full jitter**: exponential backoff that avoids thundering herds
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use patience::{AttemptFailure, AttemptTracker, StandardRetryStrategy};
//! use patience::backoff::RetryImmediately;
//!
//! let strategy = Arc::new(
//!     StandardRetryStrategy::builder()
//!         .max_attempts(3)
//!         .backoff(RetryImmediately::new())
//!         .build(),
//! );
//! let mut tracker: AttemptTracker = AttemptTracker::new(strategy, "orders");
//! tracker.acquire_initial_token();
//!
//! let succeed_on = 3;
//! let outcome = loop {
//!     let attempt = tracker.starting_attempt();
//!     if attempt >= succeed_on {
//!         tracker.record_attempt_succeeded().unwrap();
//!         break Ok(attempt);
//!     }
//!     tracker.set_last_failure(AttemptFailure::transient("connection reset"));
//!     match tracker.try_refresh_token(None).unwrap() {
//!         Some(_delay) => continue,
//!         None => break Err(tracker.build_exhaustion_failure()),
//!     }
//! };
//! assert_eq!(outcome.unwrap(), 3);
//! ```

pub mod adaptive;
#[cfg(feature = "async")]
pub mod async_waiter;
pub mod backoff;
pub mod clock;
pub mod error;
pub mod failure;
pub mod legacy;
pub mod metrics;
pub mod sleep;
pub mod strategy;
pub mod token_bucket;
pub mod tracker;
pub mod waiter;

pub use adaptive::AdaptiveRetryStrategy;
#[cfg(feature = "async")]
pub use async_waiter::AsyncWaiterExecutor;
pub use backoff::{
    Backoff, BackoffStrategy, ExponentialDelayWithJitter, FixedDelay, LegacyBackoffAdapter,
    RetryImmediately,
};
pub use clock::{ClockOffset, SkewSignal};
pub use error::{ExhaustionKind, RetryError, WaiterError};
pub use failure::{AttemptFailure, ErrorClass};
pub use legacy::{LegacyPolicyAdapter, RetryPolicy, RetryPolicyContext};
pub use metrics::{MetricsSink, NoopMetrics};
pub use sleep::{CancelToken, CancellableSleeper, FnSleeper, Sleeper, StdSleeper};
pub use strategy::{RetryStrategy, RetryToken, StandardRetryStrategy, TokenState};
pub use token_bucket::{TokenBucket, TokenBucketStore};
pub use tracker::{AttemptTracker, TrackerState};
pub use waiter::{
    WaiterAcceptor, WaiterConfig, WaiterExecutor, WaiterOutcome, WaiterResponse, WaiterState,
};
