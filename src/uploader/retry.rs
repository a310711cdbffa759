use std::cmp::min;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(120),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay.as_millis() as f64
            * self.exponential_base.powi(attempt.max(1) as i32 - 1);

        let delay = Duration::from_millis(delay_ms as u64);
        min(delay, self.max_delay)
    }
}

pub fn should_retry_status(status_code: u16) -> bool {
    matches!(status_code, 429 | 500 | 502 | 503 | 504)
}

/// Parse `retry_after` (seconds) from a JSON error body
pub fn extract_retry_after(error_text: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(error_text).ok()?;
    let seconds = value
        .get("retry_after")
        .or_else(|| value.get("parameters").and_then(|p| p.get("retry_after")))?
        .as_f64()?;

    (seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Run `op` until it succeeds, fails with a non-retryable error or runs out of
/// attempts. Sleeps between attempts honour `RateLimit` hints and are cut
/// short by `cancel`.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    what: &str,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;

    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        attempt += 1;
        if error.is_cancelled() || !error.is_retryable() || attempt > config.max_retries {
            return Err(error);
        }

        let delay = match &error {
            AppError::RateLimit { retry_after_ms } => Duration::from_millis(*retry_after_ms),
            _ => config.backoff_delay(attempt),
        };

        log::warn!(
            "{} attempt {} failed, retrying in {:?}: {}",
            what,
            attempt,
            delay,
            error
        );

        match cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(AppError::cancelled(what)),
                }
            }
            None => sleep(delay).await,
        }
    }
}
