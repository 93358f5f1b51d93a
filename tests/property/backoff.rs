//! Property tests for the retry backoff schedule.

use std::time::Duration;

use courier::sync::backoff_delay;
use proptest::prelude::*;

fn arb_base() -> impl Strategy<Value = Duration> {
    (1u64..5_000).prop_map(Duration::from_millis)
}

proptest! {
    #[test]
    fn never_exceeds_cap(retry in any::<u32>(), base in arb_base(), cap_ms in 1u64..120_000) {
        let cap = Duration::from_millis(cap_ms);
        prop_assert!(backoff_delay(retry, base, cap) <= cap);
    }

    #[test]
    fn grows_monotonically(retry in 0u32..64, base in arb_base()) {
        let cap = Duration::from_secs(30);
        prop_assert!(backoff_delay(retry, base, cap) <= backoff_delay(retry + 1, base, cap));
    }

    #[test]
    fn doubles_until_capped(retry in 0u32..20, base in arb_base()) {
        let cap = Duration::from_secs(3_600);
        let this = backoff_delay(retry, base, cap);
        let next = backoff_delay(retry + 1, base, cap);
        if next < cap {
            prop_assert_eq!(next, this * 2);
        }
    }

    #[test]
    fn first_retry_waits_at_least_base(base in arb_base()) {
        let cap = Duration::from_secs(30);
        prop_assert!(backoff_delay(1, base, cap) >= base.min(cap));
    }
}
