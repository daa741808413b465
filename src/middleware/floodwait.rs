//! Honors the server's FLOOD_WAIT back-pressure.
//!
//! Waits are clamped to a 1s floor; a wait above the 5min ceiling is
//! refused outright rather than stalling the run past operator tolerance.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5 * 60);
const MIN_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FloodWaiter {
    max_retries: u32,
    max_wait: Duration,
}

impl FloodWaiter {
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    #[cfg(test)]
    fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Run `op`, sleeping out flood waits and re-invoking it. `op` is the
    /// whole (rate-limit acquire → transport) pair, so each re-invocation
    /// takes a fresh rate-limit token.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 0..=self.max_retries {
            let seconds = match op().await {
                Ok(value) => return Ok(value),
                Err(Error::FloodWait { seconds }) => seconds,
                Err(other) => return Err(other),
            };

            if attempt >= self.max_retries {
                log::error!("flood wait retry limit exceeded ({} attempts)", attempt + 1);
                return Err(Error::FloodWait { seconds });
            }

            let raw = Duration::from_secs(u64::from(seconds));
            if raw > self.max_wait {
                log::error!(
                    "flood wait too long: {seconds}s (max {}s)",
                    self.max_wait.as_secs()
                );
                return Err(Error::FloodWaitTooLong {
                    seconds,
                    cap_secs: self.max_wait.as_secs(),
                });
            }
            let wait = raw.max(MIN_WAIT);

            log::warn!(
                "flood wait: sleeping {}s (attempt {}/{})",
                wait.as_secs(),
                attempt + 1,
                self.max_retries + 1,
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        unreachable!("flood wait loop returns from within")
    }
}

impl Default for FloodWaiter {
    fn default() -> Self {
        Self::new()
    }
}
