//! Property-style tests for the invariants enumerated in spec §8,
//! using `proptest` the way the teacher's `extraction` package declares
//! it as a dev-dependency for exactly this kind of testable invariant
//! (SPEC_FULL.md B.5).

use browse_engine::types::{ApiPattern, RenderTier};
use proptest::prelude::*;

/// §8 property 2: the tier ordering is total and strictly increasing
/// along `RenderTier::ORDER`/`next()` — there is no way to "skip
/// backwards" by repeatedly calling `next()`.
#[test]
fn tier_ordering_is_total_and_monotonic() {
    let mut tier = RenderTier::Intelligence;
    let mut seen = vec![tier];
    while let Some(next) = tier.next() {
        assert!(next > tier, "tier ordering must strictly increase");
        seen.push(next);
        tier = next;
    }
    assert_eq!(seen, vec![RenderTier::Intelligence, RenderTier::Lightweight, RenderTier::Playwright]);
}

proptest! {
    /// §8 property 7: consecutive successful `update_metrics` calls never
    /// decrease a pattern's confidence.
    #[test]
    fn confidence_never_decreases_on_consecutive_successes(
        successes in 1usize..50,
        durations in prop::collection::vec(1u64..5000, 1..50),
    ) {
        let mut pattern = ApiPattern::new("/posts/{id}", "GET");
        let mut previous = pattern.confidence;
        for i in 0..successes {
            let duration = durations[i % durations.len()];
            pattern.update_metrics(true, duration, None);
            prop_assert!(pattern.confidence >= previous - f32::EPSILON);
            previous = pattern.confidence;
        }
    }

    /// §8 property 7 (failure half): consecutive failures monotonically
    /// decrease confidence until it floors at 0.0.
    #[test]
    fn confidence_never_increases_on_consecutive_failures(failures in 1usize..50) {
        let mut pattern = ApiPattern::new("/posts/{id}", "GET");
        let mut previous = pattern.confidence;
        for _ in 0..failures {
            pattern.update_metrics(false, 100, Some("timeout".to_string()));
            prop_assert!(pattern.confidence <= previous + f32::EPSILON);
            previous = pattern.confidence;
        }
        prop_assert!(pattern.confidence >= 0.0);
    }

    /// §8 property 5: two API URLs differing only in a numeric or
    /// uuid-like segment templatize to the same shape.
    #[test]
    fn numeric_segments_templatize_identically(a in 1000u64..999_999_999, b in 1000u64..999_999_999) {
        let path_a = format!("/posts/{a}/comments");
        let path_b = format!("/posts/{b}/comments");
        prop_assert_eq!(
            browse_engine::types::api_pattern::templatize_path(&path_a),
            browse_engine::types::api_pattern::templatize_path(&path_b)
        );
    }
}
