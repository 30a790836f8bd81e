//! Transient-fault retry for short storage operations
//!
//! Lock contention and dropped connections are retried at a fixed delay until
//! the operation succeeds or the run is cancelled. Semantic errors (syntax,
//! constraint violations) are returned after the first attempt. Bulk loads are
//! never wrapped: a partially applied load cannot be replayed safely.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ImportError, Result};

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries until success or cancellation
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Run `op`, retrying while it fails with a transient error.
    ///
    /// Blocking: call from a worker thread, not an async task.
    pub fn run<T, F>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            attempt += 1;

            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && !self.exhausted(attempt) => {
                    warn!(
                        "{} hit a transient error (attempt {}), retrying in {:?}: {}",
                        what, attempt, self.delay, e
                    );
                    sleep_unless_cancelled(self.delay, cancel)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Sleep for `delay`, returning early with `Cancelled` if the token fires
fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    let deadline = Instant::now() + delay;
    let slice = Duration::from_millis(20);
    loop {
        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}
