//! Token-bucket pacing of outbound RPCs.
//!
//! A bucket of `burst` tokens refills at `rate` tokens per second; every
//! RPC takes one token before touching the transport. Rate and burst are
//! adjustable at runtime without resetting the accumulated tokens.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug)]
struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled_at = now;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                burst,
                // Start full so the initial burst is free.
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available. A non-positive
    /// rate disables pacing.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.rate <= 0.0 {
                    return Ok(());
                }
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Update the refill rate. Accumulated tokens are kept.
    pub async fn set_rate(&self, rate: f64) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.rate = rate;
        log::info!("rate limit updated to {rate:.1} req/s");
    }

    /// Update the burst size. Accumulated tokens are kept (clamped to the
    /// new burst).
    pub async fn set_burst(&self, burst: u32) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.burst = burst.max(1) as f64;
        bucket.tokens = bucket.tokens.min(bucket.burst);
        log::info!("rate limit burst updated to {burst}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_free_then_rate_paces() {
        let limiter = RateLimiter::new(1.0, 2);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Bucket is empty; the third acquire waits a full token.
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn window_bound_holds() {
        // Over a 10s window at rate R with burst B, at most 10R + B
        // acquisitions may complete.
        let limiter = RateLimiter::new(2.0, 3);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut acquired = 0u32;
        while start.elapsed() <= Duration::from_secs(10) {
            limiter.acquire(&cancel).await.unwrap();
            acquired += 1;
            if acquired > 40 {
                break;
            }
        }
        assert!(acquired <= 2 * 10 + 3 + 1, "acquired {acquired}");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_update_keeps_accumulated_tokens() {
        let limiter = RateLimiter::new(1.0, 5);
        let cancel = CancellationToken::new();

        // Spend nothing, then slow the rate way down; the full bucket
        // must still serve 5 immediate acquisitions.
        limiter.set_rate(0.01).await;
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn shrinking_burst_clamps_tokens() {
        let limiter = RateLimiter::new(1.0, 10);
        let cancel = CancellationToken::new();

        limiter.set_burst(1).await;
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_returns_canceled() {
        let limiter = RateLimiter::new(0.001, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child.cancel();
        });

        let result = limiter.acquire(&cancel).await;
        assert!(matches!(result, Err(Error::Canceled)));
    }
}
