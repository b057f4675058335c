use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
        }
    }
}

/// Retry a remote operation on transient errors with exponential backoff and
/// jitter. Non-retryable errors are returned on first sight.
pub fn with_retry<T>(
    config: &RetryConfig,
    op_name: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "{op_name}: transient error (attempt {attempt}/{}), retrying: {e}",
                    config.max_retries,
                );
                let jitter = if delay_ms > 0 {
                    rand::random::<u64>() % delay_ms
                } else {
                    0
                };
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms.saturating_mul(2)).min(config.retry_max_delay_ms);
            }
            Err(e) => return Err(e),
        }
    }
}
