//! Bounded exponential backoff for transient remote failures.
//!
//! Only errors for which [`IoError::is_transient`] holds are retried. Each
//! attempt runs under its own timeout; an attempt that exceeds it counts as
//! a transient `Timeout`. When every attempt fails the caller receives
//! [`IoError::Unreachable`], which callers see as `UnreachableSource`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::RangeReader;
use crate::error::IoError;

/// Default number of attempts (the first try plus three retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default ceiling for a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry schedule for remote reads.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Upper bound on one attempt; `None` disables the timeout.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            multiplier: 2.0,
            max_backoff: DEFAULT_MAX_BACKOFF,
            attempt_timeout: Some(DEFAULT_ATTEMPT_TIMEOUT),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, identifier: &str, mut op: F) -> Result<T, IoError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IoError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(IoError::Timeout(format!(
                        "{}: attempt exceeded {:?}",
                        identifier, limit
                    ))),
                },
                None => op().await,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(identifier, attempt, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(identifier, attempts = attempt, error = %err, "giving up on source");
                return Err(IoError::Unreachable {
                    identifier: identifier.to_string(),
                    attempts: attempt,
                    message: err.to_string(),
                });
            }

            let delay = self.backoff_for(attempt);
            warn!(
                identifier,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// RangeReader wrapper that applies a [`RetryPolicy`] to every read.
pub struct RetryingReader<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: RangeReader> RetryingReader<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<R: RangeReader> RangeReader for RetryingReader<R> {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        self.policy
            .run(self.inner.identifier(), || self.inner.read_exact_at(offset, len))
            .await
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn identifier(&self) -> &str {
        self.inner.identifier()
    }
}
