//! Retry with exponential backoff and jitter.
//!
//! Wraps transient transport failures (see [`Error::is_retryable`]); all
//! other kinds surface immediately. The jitter source is the OS CSPRNG so
//! a fleet of clients backing off from the same incident does not
//! re-converge on the same instant.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

const JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct Retrier {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Retrier {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs(config.base_delay),
            max_delay: Duration::from_secs(config.max_delay),
        }
    }

    /// Run `op`, retrying retryable failures up to `max_retries` times.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        log::info!("operation succeeded after {attempt} retries");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    last_err = Some(err);
                }
                Err(err) => {
                    log::debug!("error not retryable: {err}");
                    return Err(err);
                }
            }

            if attempt == self.max_retries {
                break;
            }

            let delay = self.delay_for(attempt);
            log::warn!(
                "retry attempt {} after error: {} (waiting {:.1}s)",
                attempt + 1,
                last_err.as_ref().expect("retryable error recorded"),
                delay.as_secs_f64(),
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(Error::RetriesExhausted {
            attempts: self.max_retries,
            source: Box::new(last_err.expect("at least one failure before exhaustion")),
        })
    }

    /// `min(base · 2^attempt, max)` scaled by a ±10% jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        delay = delay.min(self.max_delay.as_secs_f64());

        let jitter = delay * JITTER_FACTOR * (secure_unit() * 2.0 - 1.0);
        delay += jitter;
        if delay < 0.0 {
            delay = self.base_delay.as_secs_f64();
        }

        Duration::from_secs_f64(delay)
    }
}

/// Uniform value in [0, 1) from the OS CSPRNG.
fn secure_unit() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        // No entropy, no jitter.
        return 0.5;
    }
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}
