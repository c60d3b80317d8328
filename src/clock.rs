//! Shared clock-offset state consumed by the request-signing collaborator.
//!
//! Clock skew between client and server can invalidate time-based request
//! signatures. The attempt tracker applies detected skew to a shared
//! [`ClockOffset`] before the next attempt is prepared; the signing layer
//! reads the same value when it stamps the request.

use std::sync::atomic::{AtomicI64, Ordering};

/// Skew detected from a prior response, in milliseconds.
///
/// Positive values mean the client clock is ahead of the server clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewSignal {
    /// Offset to apply, in milliseconds.
    pub offset_millis: i64,
}

impl SkewSignal {
    /// Create a skew signal.
    pub fn new(offset_millis: i64) -> Self {
        Self { offset_millis }
    }
}

/// Time offset shared between the retry layer and the signing collaborator.
///
/// Owned by an execution context and passed by reference, never a process
/// global, so tests can substitute their own instance.
#[derive(Debug, Default)]
pub struct ClockOffset {
    millis: AtomicI64,
}

impl ClockOffset {
    /// Create a zero offset.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current offset in milliseconds.
    pub fn current_millis(&self) -> i64 {
        self.millis.load(Ordering::Acquire)
    }

    /// Replace the offset.
    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_starts_at_zero_and_is_replaceable() {
        let offset = ClockOffset::new();
        assert_eq!(offset.current_millis(), 0);

        offset.set_millis(-1500);
        assert_eq!(offset.current_millis(), -1500);
    }
}
