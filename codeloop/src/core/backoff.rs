//! Fixed retry delay schedule for upstream calls.

use std::time::Duration;

use anyhow::{Result, anyhow};

/// Delays slept between consecutive upstream retries.
///
/// A schedule with `n` delays allows `n + 1` calls in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn from_secs(delays: &[u64]) -> Self {
        Self {
            delays: delays.iter().map(|secs| Duration::from_secs(*secs)).collect(),
        }
    }

    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Delay to sleep after the `retry`-th failed call (0-based).
    pub fn delay_for(&self, retry: usize) -> Option<Duration> {
        self.delays.get(retry).copied()
    }

    pub fn max_calls(&self) -> usize {
        self.delays.len() + 1
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn validate(&self) -> Result<()> {
        if self.delays.iter().any(Duration::is_zero) {
            return Err(anyhow!("upstream.retry_delays_secs entries must be > 0"));
        }
        Ok(())
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_secs(&[2, 4, 8])
    }
}
