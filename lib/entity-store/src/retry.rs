//! Refresh loop driver.

use std::{future::Future, time::Duration};

use entity_error::{ErrorChainExt as _, GenericError};
use rand::Rng as _;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metadata::ProviderError;

/// Backoff schedule for slow-changing attributes.
pub const LONG_BACKOFF_SCHEDULE: &[Duration] = &[
    Duration::ZERO,
    Duration::from_secs(60),
    Duration::from_secs(60),
    Duration::from_secs(180),
    Duration::from_secs(180),
    Duration::from_secs(180),
    Duration::from_secs(600),
];

/// Default lower bound of the wait after a successful refresh.
pub const DEFAULT_SUCCESS_JITTER_MIN: Duration = Duration::from_secs(60);

/// Default upper bound of the wait after a successful refresh.
pub const DEFAULT_SUCCESS_JITTER_MAX: Duration = Duration::from_secs(180);

/// Drives a fallible update function until it is done, gives up, or is shut down.
///
/// After a failure, the retryer waits according to its backoff schedule: the `n`th consecutive failure waits
/// `schedule[n]`, and the last entry is reused once the schedule is exhausted. Indexing starts at one, so the first
/// entry is never used as a failure wait; schedules conventionally start with zero. After a success, the retryer
/// either stops (one-time mode) or waits a random duration within the success jitter range before refreshing again.
///
/// The loop stops when:
///
/// - the update succeeds in one-time mode
/// - the maximum number of attempts has been made
/// - the shutdown token is cancelled, whether the retryer is waiting or the update is in flight
/// - the update fails with a non-retryable [`ProviderError`], unless configured to retry any error
#[derive(Clone, Debug)]
pub struct Retryer {
    name: &'static str,
    shutdown: CancellationToken,
    one_time: bool,
    retry_any_error: bool,
    success_jitter_min: Duration,
    success_jitter_max: Duration,
    backoff_schedule: &'static [Duration],
    max_attempts: Option<usize>,
}

impl Retryer {
    /// Creates a new `Retryer` that stops when `shutdown` is cancelled.
    ///
    /// Defaults to refreshing forever, stopping early on non-retryable errors, with the long backoff schedule and a
    /// success jitter between one and three minutes.
    pub fn new(name: &'static str, shutdown: CancellationToken) -> Self {
        Self {
            name,
            shutdown,
            one_time: false,
            retry_any_error: false,
            success_jitter_min: DEFAULT_SUCCESS_JITTER_MIN,
            success_jitter_max: DEFAULT_SUCCESS_JITTER_MAX,
            backoff_schedule: LONG_BACKOFF_SCHEDULE,
            max_attempts: None,
        }
    }

    /// Sets whether to stop after the first success.
    pub fn one_time(mut self, one_time: bool) -> Self {
        self.one_time = one_time;
        self
    }

    /// Sets whether errors with non-retryable error codes are retried anyway.
    pub fn retry_any_error(mut self, retry_any_error: bool) -> Self {
        self.retry_any_error = retry_any_error;
        self
    }

    /// Sets the range of the wait after a success.
    ///
    /// If `max` is lower than `min`, it is raised to `min`.
    pub fn success_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.success_jitter_min = min;
        self.success_jitter_max = max.max(min);
        self
    }

    /// Sets the backoff schedule.
    ///
    /// An empty schedule retries immediately.
    pub fn backoff_schedule(mut self, schedule: &'static [Duration]) -> Self {
        self.backoff_schedule = schedule;
        self
    }

    /// Sets the maximum number of attempts, or `None` for no limit.
    pub fn max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the wait after a success.
    ///
    /// Uniformly distributed over `[min, max)`, or exactly `min` if both bounds are equal.
    pub fn success_wait(&self) -> Duration {
        if self.success_jitter_min >= self.success_jitter_max {
            return self.success_jitter_min;
        }
        rand::rng().random_range(self.success_jitter_min..self.success_jitter_max)
    }

    /// Returns the wait after the `retry`th consecutive failure.
    pub fn failure_wait(&self, retry: usize) -> Duration {
        match self.backoff_schedule.len() {
            0 => Duration::ZERO,
            len => self.backoff_schedule[retry.min(len - 1)],
        }
    }

    /// Runs the loop, returning the number of times `update` was called to completion.
    pub async fn run<F, Fut>(&self, mut update: F) -> usize
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), GenericError>>,
    {
        let name = self.name;
        let mut attempts = 0;
        let mut retry = 1;

        loop {
            let result = select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!(retryer = name, attempts, "Shutdown observed. Stopping.");
                    return attempts;
                },
                result = update() => result,
            };
            attempts += 1;

            let wait = match &result {
                Ok(()) if self.one_time => return attempts,
                Ok(()) => self.success_wait(),
                Err(e) => {
                    if !self.retry_any_error && !is_retryable(e) {
                        warn!(retryer = name, error = %e, "Update failed with a non-retryable error. Stopping.");
                        return attempts;
                    }
                    self.failure_wait(retry)
                }
            };

            if self.max_attempts.is_some_and(|max_attempts| attempts >= max_attempts) {
                debug!(retryer = name, attempts, "Reached maximum number of attempts. Stopping.");
                return attempts;
            }

            select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!(retryer = name, attempts, "Shutdown observed. Stopping.");
                    return attempts;
                },
                _ = sleep(wait) => {},
            }

            match result {
                Ok(()) => retry = 1,
                Err(e) => {
                    debug!(retryer = name, retry, error = %e, "Update failed. Retrying.");
                    retry += 1;
                }
            }
        }
    }
}

fn is_retryable(error: &GenericError) -> bool {
    error
        .find_cause::<ProviderError>()
        .map_or(true, ProviderError::is_retryable)
}
