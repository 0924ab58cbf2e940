//! Property-based tests for the retry backoff schedule.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use yume_reasoning::Backoff;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Retry n >= 2 waits within [base*2^(n-2), base*2^(n-1)], capped.
    #[test]
    fn backoff_within_doubling_band(attempt in 2u32..12, seed in any::<u64>()) {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(seed);
        let delay = backoff.delay(attempt, &mut rng);

        let upper = (backoff.base * 2u32.pow(attempt - 1)).min(backoff.max);
        let lower = upper / 2;
        prop_assert!(delay >= lower, "attempt {}: {:?} < {:?}", attempt, delay, lower);
        prop_assert!(delay <= upper, "attempt {}: {:?} > {:?}", attempt, delay, upper);
    }

    /// Never exceeds the configured maximum, whatever the base.
    #[test]
    fn backoff_never_exceeds_max(
        base_ms in 1u64..2_000,
        max_ms in 2_000u64..20_000,
        attempt in 1u32..64,
        seed in any::<u64>(),
    ) {
        let backoff = Backoff {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        };
        let mut rng = StdRng::seed_from_u64(seed);
        prop_assert!(backoff.delay(attempt, &mut rng) <= backoff.max);
    }

    /// The first retry is never jittered.
    #[test]
    fn first_retry_is_base(seed in any::<u64>()) {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(seed);
        prop_assert_eq!(backoff.delay(1, &mut rng), backoff.base);
    }
}
