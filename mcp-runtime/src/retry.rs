//! Bounded retry around a single upstream fetch.
//!
//! Network failures, 5xx and 429 are retried on an exponential schedule with
//! jitter (`backon`). A 429 `Retry-After` raises the delay to at least the
//! advertised wait, capped so one rate-limit signal cannot consume a whole
//! client budget. Any other 4xx is surfaced on the first attempt. No retry is
//! scheduled if its delay would end past the caller's deadline.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::RetrievalError;
use crate::upstream::UpstreamError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const MIN_MAX_ATTEMPTS: u32 = 3;
pub const MAX_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);
const DEFAULT_MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    max_attempts: u32,
    #[serde(serialize_with = "serialize_millis")]
    min_delay: Duration,
    #[serde(serialize_with = "serialize_millis")]
    max_delay: Duration,
    #[serde(serialize_with = "serialize_millis")]
    max_rate_limit_wait: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try and is clamped to 3..=5.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.clamp(MIN_MAX_ATTEMPTS, MAX_MAX_ATTEMPTS),
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
            jitter: true,
        }
    }

    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn backoff_builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::new()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times((self.max_attempts - 1) as usize);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Runs `fetch_once` until it succeeds, fails permanently, the attempt
    /// budget is spent, or the next retry would not finish sleeping before
    /// `deadline`.
    pub async fn fetch_page_with_retry<F, Fut>(
        &self,
        deadline: Instant,
        fetch_once: F,
    ) -> Result<Value, RetrievalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, UpstreamError>>,
    {
        let cap = self.max_rate_limit_wait;
        let max_attempts = self.max_attempts;
        let mut retries = 0;
        let mut out_of_time = false;

        let result = fetch_once
            .retry(self.backoff_builder())
            .sleep(tokio::time::sleep)
            .when(UpstreamError::is_transient)
            .adjust(|err: &UpstreamError, delay: Option<Duration>| {
                let delay = adjust_for_rate_limit(err, delay, cap)?;
                if Instant::now() + delay >= deadline {
                    out_of_time = true;
                    return None;
                }
                Some(delay)
            })
            .notify(|err: &UpstreamError, delay: Duration| {
                retries += 1;
                tracing::warn!(
                    event = "upstream_retry",
                    attempt = retries,
                    max_attempts,
                    status = ?err.status(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient upstream failure, retrying"
                );
            })
            .await;

        match result {
            Ok(payload) => Ok(payload),
            Err(err) if !err.is_transient() => Err(RetrievalError::rejected(err)),
            Err(err) => {
                let attempts = retries + 1;
                tracing::warn!(
                    event = "upstream_retries_exhausted",
                    attempts,
                    out_of_time,
                    status = ?err.status(),
                    error = %err,
                    "Giving up on upstream request"
                );
                Err(RetrievalError::unavailable(attempts, &err))
            }
        }
    }
}

/// On 429 with `Retry-After`, wait at least the advertised time (capped).
/// Shaped for `backon::Retry::adjust`: `None` means no further retry.
pub fn adjust_for_rate_limit(
    err: &UpstreamError,
    delay: Option<Duration>,
    cap: Duration,
) -> Option<Duration> {
    match (err.retry_after(), delay) {
        (Some(advertised), Some(delay)) => Some(delay.max(advertised.min(cap))),
        (_, delay) => delay,
    }
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}
