use std::future::Future;

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{self, Error};

/// Retry policy: exponential backoff with a cap and optional jitter.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiply each delay by `1 + U(0, 0.25)`.
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 1_000, max_delay_ms: 30_000, jitter: true }
    }
}

/// Backoff delay before retry number `attempt` (0-based), without jitter:
/// `base * 2^attempt`, capped at `max_delay_ms`.
pub fn compute_delay_ms(opts: &RetryOptions, attempt: u32) -> u64 {
    opts.base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(opts.max_delay_ms)
}

fn with_jitter(delay_ms: u64, jitter: bool) -> u64 {
    if !jitter {
        return delay_ms;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
    (delay_ms as f64 * factor) as u64
}

/// Sleep that wakes immediately on cancellation.
///
/// Returns `Err` when cancelled so callers stop retrying right away.
async fn backoff_sleep(operation: &str, delay_ms: u64, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => Ok(()),
        _ = cancel.cancelled() => Err(anyhow::Error::new(Error::Timeout {
            operation: format!("{operation} (cancelled)"),
            elapsed_ms: 0,
        })),
    }
}

/// Run `f` with retries, backing off between attempts.
///
/// `should_retry` decides whether a failure is worth another attempt; the
/// default classifier treats network, rate-limit and timeout kinds as
/// transient. The final error is returned unchanged.
pub async fn retry_if<T, F, Fut, P>(
    operation: &str,
    opts: &RetryOptions,
    cancel: &CancellationToken,
    should_retry: P,
    f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&anyhow::Error, u32) -> bool,
{
    retry_inner(operation, opts, cancel, false, should_retry, f).await
}

async fn retry_inner<T, F, Fut, P>(
    operation: &str,
    opts: &RetryOptions,
    cancel: &CancellationToken,
    honor_retry_after: bool,
    mut should_retry: P,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&anyhow::Error, u32) -> bool,
{
    let attempts = opts.max_retries.max(1);
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(last_err.unwrap_or_else(|| {
                anyhow::Error::new(Error::Timeout {
                    operation: format!("{operation} (cancelled)"),
                    elapsed_ms: 0,
                })
            }));
        }

        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let retryable = attempt + 1 < attempts && should_retry(&e, attempt);
                if !retryable {
                    return Err(e);
                }
                // A rate-limit response carrying retry-after overrides the
                // computed backoff, clamped to the delay cap.
                let delay = match error::retry_after_ms(&e).filter(|_| honor_retry_after) {
                    Some(ra) => ra.min(opts.max_delay_ms),
                    None => with_jitter(compute_delay_ms(opts, attempt), opts.jitter),
                };
                warn!(
                    "{operation}: attempt {}/{} failed ({e}), retrying in {delay} ms",
                    attempt + 1,
                    attempts
                );
                last_err = Some(e);
                backoff_sleep(operation, delay, cancel).await?;
            }
        }
    }

    debug!("{operation}: out of attempts");
    Err(last_err.unwrap_or_else(|| anyhow::Error::new(Error::Unknown(format!("{operation}: no attempts made")))))
}

/// Retry with the default transient-error classifier.
pub async fn retry<T, F, Fut>(
    operation: &str,
    opts: &RetryOptions,
    cancel: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_inner(operation, opts, cancel, false, |e, _| error::is_retryable(e), f).await
}

/// Like [`retry`], but an upstream `retry-after` hint takes precedence over
/// the computed backoff (clamped to `max_delay_ms`).
pub async fn retry_with_rate_limit<T, F, Fut>(
    operation: &str,
    opts: &RetryOptions,
    cancel: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_inner(operation, opts, cancel, true, |e, _| error::is_retryable(e), f).await
}

/// Parse an upstream `retry-after` value into milliseconds.
///
/// Accepts integer seconds or an HTTP-date; result clamped to
/// `[0, max_delay_ms]`.
pub fn parse_retry_after(value: &str, max_delay_ms: u64) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some((secs * 1_000).min(max_delay_ms));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta_ms = (date.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_milliseconds();
    Some((delta_ms.max(0) as u64).min(max_delay_ms))
}
