//! Backoff schedule for completion retries.
//!
//! Retry n waits `min(base * 2^(n-1), max)` split into a fixed half and a
//! uniformly jittered half, so calls sharing one limiter do not retry in
//! lockstep. The first retry always waits exactly `base`.

use rand::Rng;
use std::time::Duration;

pub const BASE_DELAY: Duration = Duration::from_millis(500);
pub const MAX_DELAY: Duration = Duration::from_secs(8);

/// Hard ceiling on retries, whatever the configuration says.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: BASE_DELAY,
            max: MAX_DELAY,
        }
    }
}

impl Backoff {
    /// Upper bound for retry `attempt` (1-based) before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.base;
        }
        let shift = (attempt - 1).min(20);
        self.base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before retry `attempt`, drawing jitter from `rng`.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt <= 1 {
            return self.base;
        }
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let jitter_ms = rng.gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_first_retry_is_fixed() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(Backoff::default().delay(1, &mut rng), BASE_DELAY);
    }

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let b = Backoff::default();
        assert_eq!(b.ceiling(2), Duration::from_secs(1));
        assert_eq!(b.ceiling(3), Duration::from_secs(2));
        assert_eq!(b.ceiling(5), Duration::from_secs(8));
        assert_eq!(b.ceiling(30), Duration::from_secs(8));
    }
}
