//! Upstream call guard: bounded backoff around the generation service.
//!
//! Transport reliability is budgeted separately from code quality. Transient
//! upstream failures are absorbed here and never consume a supervisor retry.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::core::backoff::BackoffSchedule;
use crate::io::generator::{GenerationRequest, Generator, UpstreamError};

/// Sleep seam so tests can observe backoff without waiting.
///
/// A sleeper may return early once `cancel` fires.
pub trait Sleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken);
}

impl<T: Sleeper + ?Sized> Sleeper for &T {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) {
        (**self).sleep(duration, cancel);
    }
}

/// How often a backoff sleep re-checks its cancel token.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) {
        let deadline = Instant::now() + duration;
        while !cancel.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

/// The guard gave up: the upstream stayed unavailable or failed fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamExhausted {
    /// Calls made, including the first.
    pub attempts: usize,
    pub last_error: UpstreamError,
}

impl UpstreamExhausted {
    /// The guard stopped because the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.last_error == UpstreamError::Cancelled
    }
}

impl fmt::Display for UpstreamExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "upstream unavailable after {} call(s): {}",
            self.attempts, self.last_error
        )
    }
}

impl std::error::Error for UpstreamExhausted {}

pub struct UpstreamGuard<S> {
    schedule: BackoffSchedule,
    sleeper: S,
}

impl<S: Sleeper> UpstreamGuard<S> {
    pub fn new(schedule: BackoffSchedule, sleeper: S) -> Self {
        Self { schedule, sleeper }
    }

    /// Call `op`, retrying transient failures on the backoff schedule.
    ///
    /// Cancellation ends the loop between calls and interrupts backoff.
    pub fn call<T>(
        &self,
        cancel: &CancelToken,
        mut op: impl FnMut() -> Result<T, UpstreamError>,
    ) -> Result<T, UpstreamExhausted> {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                info!(attempts, "upstream call cancelled");
                return Err(UpstreamExhausted {
                    attempts,
                    last_error: UpstreamError::Cancelled,
                });
            }
            attempts += 1;
            let err = match op() {
                Ok(value) => {
                    if attempts > 1 {
                        info!(attempts, "upstream recovered");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            if err == UpstreamError::Cancelled {
                info!(attempts, "upstream call cancelled");
                return Err(UpstreamExhausted {
                    attempts,
                    last_error: err,
                });
            }
            if !err.is_transient() {
                warn!(attempts, error = %err, "upstream failed fatally");
                return Err(UpstreamExhausted {
                    attempts,
                    last_error: err,
                });
            }
            let Some(delay) = self.schedule.delay_for(attempts - 1) else {
                warn!(attempts, error = %err, "upstream retry budget spent");
                return Err(UpstreamExhausted {
                    attempts,
                    last_error: err,
                });
            };
            warn!(
                attempts,
                delay_secs = delay.as_secs(),
                error = %err,
                "transient upstream failure, backing off"
            );
            self.sleeper.sleep(delay, cancel);
        }
    }

    pub fn generate<G: Generator>(
        &self,
        generator: &G,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<String, UpstreamExhausted> {
        self.call(cancel, || generator.generate(request, cancel))
    }
}
