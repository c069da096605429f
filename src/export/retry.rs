//! Bounded exponential-backoff retry
//!
//! Only transient backend errors are retried. Sleeping goes through a
//! [`Sleeper`] so a cancellation can cut a backoff short and abort the run.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::types::{FusionError, FusionResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Sleeps between consecutive attempts: `max_attempts - 1` entries
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_attempts.saturating_sub(1))
            .map(|k| self.initial_delay.mul_f64(self.backoff.powi(k as i32)))
            .collect()
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out
    pub fn run<T, S, F>(&self, sleeper: &S, mut op: F) -> FusionResult<T>
    where
        S: Sleeper + ?Sized,
        F: FnMut(u32) -> FusionResult<T>,
    {
        let delays = self.delays();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = delays[(attempt - 1) as usize];
                    log::warn!(
                        "Attempt {} of {} failed: {}; retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    sleeper.sleep(delay)?;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        log::error!("Giving up after {} attempts: {}", attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

pub trait Sleeper {
    /// Block for `duration`; `Err(Cancelled)` aborts the retry loop
    fn sleep(&self, duration: Duration) -> FusionResult<()>;

    /// `Err(Cancelled)` once the run has been asked to stop
    fn check_cancelled(&self) -> FusionResult<()> {
        Ok(())
    }
}

/// Shared cancellation flag that wakes sleeping retries
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `timeout`; true when cancelled
    fn wait(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Real-time sleeper honouring a cancellation token
#[derive(Debug, Clone, Default)]
pub struct ThreadSleeper {
    token: CancellationToken,
}

impl ThreadSleeper {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) -> FusionResult<()> {
        if self.token.wait(duration) {
            log::warn!("Retry wait interrupted by cancellation");
            Err(FusionError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn check_cancelled(&self) -> FusionResult<()> {
        if self.token.is_cancelled() {
            Err(FusionError::Cancelled)
        } else {
            Ok(())
        }
    }
}
