//! Token-bucket rate limiter for completion calls.
//!
//! The bucket starts full with `rate` tokens and gains one token every
//! `60s / rate`; a refill that finds the bucket full is dropped. The live
//! bucket sits behind an `ArcSwap` so a configuration reload can replace it
//! while callers are waiting on the old one.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

struct TokenBucket {
    tokens: Arc<Semaphore>,
    rate: u32,
    refill: JoinHandle<()>,
}

impl TokenBucket {
    fn new(rate: u32) -> Self {
        let rate = rate.max(1);
        let tokens = Arc::new(Semaphore::new(rate as usize));
        let period = Duration::from_secs(60) / rate;

        let refill_tokens = Arc::clone(&tokens);
        let refill = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if refill_tokens.is_closed() {
                    break;
                }
                if refill_tokens.available_permits() < rate as usize {
                    refill_tokens.add_permits(1);
                }
            }
        });

        Self {
            tokens,
            rate,
            refill,
        }
    }

    fn retire(&self) {
        self.tokens.close();
        self.refill.abort();
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.retire();
    }
}

/// Returned when no token became available in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireTimeout;

/// Shared, resettable limiter. Must be created inside a tokio runtime.
pub struct RateLimiter {
    bucket: ArcSwap<TokenBucket>,
}

impl RateLimiter {
    /// `rate` is requests per minute.
    pub fn new(rate: u32) -> Self {
        Self {
            bucket: ArcSwap::from_pointee(TokenBucket::new(rate)),
        }
    }

    pub fn rate(&self) -> u32 {
        self.bucket.load().rate
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> usize {
        self.bucket.load().tokens.available_permits()
    }

    /// Take one token, waiting at most `wait`.
    ///
    /// A caller parked on a bucket that gets replaced moves over to the new
    /// bucket and keeps waiting against the same deadline.
    pub async fn acquire(&self, wait: Duration) -> Result<(), AcquireTimeout> {
        let deadline = Instant::now() + wait;
        loop {
            let bucket = self.bucket.load_full();
            let tokens = Arc::clone(&bucket.tokens);
            drop(bucket);
            match tokio::time::timeout_at(deadline, tokens.acquire_owned()).await {
                Err(_) => return Err(AcquireTimeout),
                Ok(Ok(permit)) => {
                    permit.forget();
                    return Ok(());
                }
                Ok(Err(_closed)) => {
                    tracing::debug!("Rate limiter was reset while waiting, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Replace the bucket with a fresh, full one at the new rate.
    pub fn reset(&self, rate: u32) {
        let old = self.bucket.swap(Arc::new(TokenBucket::new(rate)));
        old.retire();
        tracing::info!("Rate limiter reset to {}/min", rate.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            limiter.acquire(Duration::ZERO).await.unwrap();
        }
        assert_eq!(
            limiter.acquire(Duration::from_secs(1)).await,
            Err(AcquireTimeout)
        );

        // One token every 20s.
        let start = Instant::now();
        limiter.acquire(Duration::from_secs(30)).await.unwrap();
        let waited = start.elapsed();
        assert!(waited <= Duration::from_secs(20), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let limiter = RateLimiter::new(2);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_releases_waiters() {
        let limiter = Arc::new(RateLimiter::new(1));
        limiter.acquire(Duration::ZERO).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        limiter.reset(10);
        assert_eq!(limiter.rate(), 10);
        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert_eq!(limiter.available(), 9);
    }
}
