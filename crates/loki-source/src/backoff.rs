// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Jittered exponential backoff with a retry budget.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Lower bound of the first delay.
    pub min_backoff: Duration,
    /// Upper bound of any delay.
    pub max_backoff: Duration,
    /// Number of attempts allowed, 0 meaning no limit.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            max_retries: 5,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BackoffError {
    #[error("backoff cancelled after {0} retries")]
    Cancelled(u32),
    #[error("terminated after {0} retries")]
    Exhausted(u32),
}

/// Tracks retries of a single operation.
///
/// Delays are drawn from `[next_min, next_max)`; both bounds double after every
/// wait until `max_backoff` is reached.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    cancel: CancellationToken,
    num_retries: u32,
    next_min: Duration,
    next_max: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            num_retries: 0,
            next_min: config.min_backoff,
            next_max: double(config.min_backoff, config.max_backoff),
        }
    }

    /// Whether another attempt should be made.
    pub fn ongoing(&self) -> bool {
        !self.cancel.is_cancelled()
            && (self.config.max_retries == 0 || self.num_retries < self.config.max_retries)
    }

    /// Why [`Backoff::ongoing`] turned false, if it did.
    pub fn err(&self) -> Option<BackoffError> {
        if self.cancel.is_cancelled() {
            return Some(BackoffError::Cancelled(self.num_retries));
        }
        if self.config.max_retries != 0 && self.num_retries >= self.config.max_retries {
            return Some(BackoffError::Exhausted(self.num_retries));
        }
        None
    }

    /// Counts a retry and sleeps for the next delay, returning early on cancellation.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        if self.ongoing() && !delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => {}
            }
        }
    }

    fn next_delay(&mut self) -> Duration {
        self.num_retries += 1;

        if self.next_min >= self.next_max {
            return self.next_min;
        }

        let spread = (self.next_max - self.next_min).as_nanos() as u64;
        let jitter = rand::thread_rng().gen_range(0..spread);
        let delay = self.next_min + Duration::from_nanos(jitter);

        if self.next_max < self.config.max_backoff {
            self.next_min = double(self.next_min, self.config.max_backoff);
            self.next_max = double(self.next_max, self.config.max_backoff);
        }
        delay
    }
}

fn double(value: Duration, max: Duration) -> Duration {
    value.saturating_mul(2).min(max)
}
