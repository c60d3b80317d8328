//! Sleep abstraction for the blocking waiter loop.
//!
//! The blocking executor parks the calling thread between polls. A
//! [`Sleeper`] decides how, and a [`CancelToken`] lets another thread abort
//! a sleep in progress, which the waiter surfaces as a distinct interrupted
//! failure rather than silently continuing.

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A backoff sleep was aborted before the full delay elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepInterrupted;

impl fmt::Display for SleepInterrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sleep was interrupted")
    }
}

impl StdError for SleepInterrupted {}

/// Trait for blocking sleep implementations.
pub trait Sleeper {
    /// Sleep for the given duration, or return early when interrupted.
    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted>;
}

/// Standard library sleeper using `std::thread::sleep`. Never interrupted.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdSleeper;

impl Sleeper for StdSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        std::thread::sleep(duration);
        Ok(())
    }
}

/// Function pointer sleeper for custom sleep implementations and tests.
#[derive(Clone, Copy)]
pub struct FnSleeper(pub fn(Duration));

impl Sleeper for FnSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        (self.0)(duration);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

/// Cancellation handle shared between a waiter and the code that aborts it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Create an un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation, waking any sleep waiting on this token.
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .expect("cancel token state poisoned");
        *cancelled = true;
        self.inner.signal.notify_all();
    }

    /// Whether cancellation has been signaled.
    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .expect("cancel token state poisoned")
    }
}

/// Sleeper that aborts early when its [`CancelToken`] is cancelled.
#[derive(Debug, Clone)]
pub struct CancellableSleeper {
    token: CancelToken,
}

impl CancellableSleeper {
    /// Create a sleeper observing the given token.
    pub fn new(token: CancelToken) -> Self {
        Self { token }
    }
}

impl Sleeper for CancellableSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        let cancelled = self
            .token
            .inner
            .cancelled
            .lock()
            .expect("cancel token state poisoned");
        let (cancelled, _timeout) = self
            .token
            .inner
            .signal
            .wait_timeout_while(cancelled, duration, |cancelled| !*cancelled)
            .expect("cancel token state poisoned");
        if *cancelled {
            Err(SleepInterrupted)
        } else {
            Ok(())
        }
    }
}
