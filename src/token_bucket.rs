//! Shared retry-capacity pool acting as a circuit breaker across executions.
//!
//! Every failed attempt withdraws capacity and every success returns it, so
//! a burst of failures across many concurrent operations drains the pool and
//! stops retries before they amplify an outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Default capacity of a per-scope token bucket.
pub const DEFAULT_BUCKET_CAPACITY: usize = 500;

/// Lock-free capacity pool shared by all executions in one scope.
///
/// Mutations go through a compare-and-swap loop on a single atomic counter,
/// so unrelated operations never serialize behind each other.
#[derive(Debug)]
pub struct TokenBucket {
    max_capacity: usize,
    capacity: AtomicUsize,
}

/// Result of a capacity withdrawal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOutcome {
    /// Whether the requested capacity was withdrawn.
    pub acquired: bool,
    /// Capacity requested by the caller.
    pub capacity_requested: usize,
    /// Capacity actually withdrawn (zero when refused).
    pub capacity_acquired: usize,
    /// Capacity left in the bucket after the call.
    pub capacity_remaining: usize,
    /// Upper bound of the bucket.
    pub max_capacity: usize,
}

/// Result of returning capacity to the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Capacity actually returned, after capping at the maximum.
    pub capacity_released: usize,
    /// Capacity in the bucket after the call.
    pub current_capacity: usize,
    /// Upper bound of the bucket.
    pub max_capacity: usize,
}

impl TokenBucket {
    /// Create a full bucket with the given maximum capacity.
    pub fn new(max_capacity: usize) -> Self {
        Self {
            max_capacity,
            capacity: AtomicUsize::new(max_capacity),
        }
    }

    /// Try to withdraw `cost` units of capacity.
    ///
    /// A zero cost always succeeds without touching the pool.
    pub fn try_acquire(&self, cost: usize) -> AcquireOutcome {
        match self
            .capacity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(cost)
            }) {
            Ok(previous) => AcquireOutcome {
                acquired: true,
                capacity_requested: cost,
                capacity_acquired: cost,
                capacity_remaining: previous - cost,
                max_capacity: self.max_capacity,
            },
            Err(current) => AcquireOutcome {
                acquired: false,
                capacity_requested: cost,
                capacity_acquired: 0,
                capacity_remaining: current,
                max_capacity: self.max_capacity,
            },
        }
    }

    /// Return `amount` units of capacity, capped at the bucket maximum.
    pub fn release(&self, amount: usize) -> ReleaseOutcome {
        let previous = self
            .capacity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(amount).min(self.max_capacity))
            })
            .unwrap_or_else(|current| current);
        let current = previous.saturating_add(amount).min(self.max_capacity);
        ReleaseOutcome {
            capacity_released: current - previous,
            current_capacity: current,
            max_capacity: self.max_capacity,
        }
    }

    /// Capacity currently available.
    pub fn current_capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Upper bound of the bucket.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }
}

/// Store of per-scope token buckets.
///
/// The map lock guards bucket lookup only; capacity mutations go through the
/// bucket's atomic counter.
#[derive(Debug)]
pub struct TokenBucketStore {
    bucket_capacity: usize,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl TokenBucketStore {
    /// Create a store whose buckets hold [`DEFAULT_BUCKET_CAPACITY`] units.
    pub fn new() -> Self {
        Self::with_bucket_capacity(DEFAULT_BUCKET_CAPACITY)
    }

    /// Create a store with a custom per-scope bucket capacity.
    pub fn with_bucket_capacity(bucket_capacity: usize) -> Self {
        Self {
            bucket_capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the bucket for a scope, creating it on first use.
    pub fn bucket_for_scope(&self, scope: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().expect("token bucket store poisoned");
        Arc::clone(
            buckets
                .entry(scope.to_owned())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.bucket_capacity))),
        )
    }
}

impl Default for TokenBucketStore {
    fn default() -> Self {
        Self::new()
    }
}
