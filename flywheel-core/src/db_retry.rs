use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::QueueError;

/// Run `operation`, retrying with exponential backoff while it keeps
/// failing with a transient error. The delay doubles (or whatever the
/// configured multiplier says) up to the cap; anything non-transient
/// surfaces immediately.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, QueueError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, QueueError>>,
{
    let max_delay = Duration::from_millis(config.max_delay_ms);
    let mut delay = Duration::from_millis(config.initial_delay_ms).min(max_delay);
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < config.max_retries && is_retryable(config, &error) => {
                attempt += 1;
                warn!(
                    %error,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient database error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * config.backoff_multiplier.max(1)).min(max_delay);
            }
            Err(error) => return Err(error),
        }
    }
}

/// Transient when the error is structurally connection-level, when its
/// SQLSTATE is in the configured list, or when the driver message mentions
/// one of the configured codes.
fn is_retryable(config: &RetryConfig, error: &QueueError) -> bool {
    if error.is_transient() {
        return true;
    }

    let QueueError::Database(db_error) = error else {
        return false;
    };

    if let sqlx::Error::Database(inner) = db_error {
        if let Some(code) = inner.code() {
            if config.retryable_codes.iter().any(|c| c.as_str() == code.as_ref()) {
                return true;
            }
        }
    }

    let message = db_error.to_string();
    config.retryable_codes.iter().any(|c| message.contains(c))
}
