//! Pure election computation functions.
//!
//! Deterministic, side-effect free helpers used by the lease lock and the
//! elector. Randomness is passed in so the timing math stays testable.

use crate::coordination::election::ElectionState;
use crate::coordination::types::Term;

/// Check whether a lease deadline has passed.
///
/// A deadline of 0 marks a released lease. The deadline itself is still
/// inside the lease, so reclaiming requires `now_ms > deadline_ms`.
#[inline]
pub fn is_lease_expired(deadline_ms: u64, now_ms: u64) -> bool {
    deadline_ms == 0 || now_ms > deadline_ms
}

/// Term for the next acquisition given the stored term, if any.
#[inline]
pub fn compute_next_term(current_term: Option<u64>) -> u64 {
    current_term.map_or(1, |t| t.saturating_add(1))
}

/// Add jitter to a base delay.
///
/// # Arguments
///
/// * `base_ms` - Base delay
/// * `jitter_factor` - Jitter as fraction of base (e.g., 0.2 for 20%)
/// * `random_value` - Random value in [0, 1]
///
/// # Returns
///
/// A delay in `[base_ms, base_ms * (1 + jitter_factor)]`.
#[inline]
pub fn compute_jittered_delay_ms(base_ms: u64, jitter_factor: f64, random_value: f64) -> u64 {
    let jitter_range = (base_ms as f64 * jitter_factor.max(0.0)) as u64;
    let jitter = (jitter_range as f64 * random_value.clamp(0.0, 1.0)) as u64;
    base_ms.saturating_add(jitter)
}

/// Exponential backoff for consecutive transient failures.
///
/// `attempt` 0 yields `base_ms`; each further attempt doubles, capped at `max_ms`.
#[inline]
pub fn compute_backoff_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms.max(base_ms))
}

/// Whether a renewal cadence leaves room for at least one retry before expiry.
///
/// A crashed leader's lease is reclaimable `lease_duration_ms` after its last
/// renewal; the live leader must renew well inside that window.
#[inline]
pub fn is_renew_interval_safe(renew_interval_ms: u64, lease_duration_ms: u64) -> bool {
    renew_interval_ms > 0 && renew_interval_ms < lease_duration_ms
}

/// Time a renewal may take before the lease could be judged expired.
///
/// Returns `None` once `deadline_ms` is no longer in the future; a leader
/// must not act on a lease in that state. Otherwise the budget is the time
/// left, capped at `renew_interval_ms`.
#[inline]
pub fn compute_renew_budget_ms(deadline_ms: u64, now_ms: u64, renew_interval_ms: u64) -> Option<u64> {
    let remaining = deadline_ms.saturating_sub(now_ms);
    (remaining > 0).then(|| remaining.min(renew_interval_ms))
}

/// State after an acquisition attempt.
///
/// ```text
/// Some(term) -> Leading { term }
/// None       -> Standby
/// ```
#[inline]
pub fn compute_state_after_acquire(acquired: Option<Term>) -> ElectionState {
    match acquired {
        Some(term) => ElectionState::Leading { term },
        None => ElectionState::Standby,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_released_lease_is_expired() {
        assert!(is_lease_expired(0, 0));
        assert!(is_lease_expired(0, 1_000));
    }

    #[test]
    fn test_deadline_boundary() {
        assert!(!is_lease_expired(1_000, 999));
        assert!(!is_lease_expired(1_000, 1_000));
        assert!(is_lease_expired(1_000, 1_001));
    }

    #[test]
    fn test_next_term() {
        assert_eq!(compute_next_term(None), 1);
        assert_eq!(compute_next_term(Some(41)), 42);
        assert_eq!(compute_next_term(Some(u64::MAX)), u64::MAX);
    }

    #[test]
    fn test_jittered_delay() {
        assert_eq!(compute_jittered_delay_ms(1000, 0.2, 0.0), 1000);
        assert_eq!(compute_jittered_delay_ms(1000, 0.2, 1.0), 1200);
        let mid = compute_jittered_delay_ms(1000, 0.2, 0.5);
        assert!((1000..=1200).contains(&mid));
    }

    #[test]
    fn test_backoff_progression() {
        assert_eq!(compute_backoff_ms(0, 100, 1_000), 100);
        assert_eq!(compute_backoff_ms(1, 100, 1_000), 200);
        assert_eq!(compute_backoff_ms(3, 100, 1_000), 800);
        assert_eq!(compute_backoff_ms(4, 100, 1_000), 1_000);
        assert_eq!(compute_backoff_ms(200, 100, 1_000), 1_000);
    }

    #[test]
    fn test_renew_interval_safety() {
        assert!(is_renew_interval_safe(5_000, 15_000));
        assert!(!is_renew_interval_safe(15_000, 15_000));
        assert!(!is_renew_interval_safe(0, 15_000));
    }

    #[test]
    fn test_renew_budget() {
        assert_eq!(compute_renew_budget_ms(10_000, 1_000, 5_000), Some(5_000));
        assert_eq!(compute_renew_budget_ms(10_000, 8_000, 5_000), Some(2_000));
        assert_eq!(compute_renew_budget_ms(10_000, 10_000, 5_000), None);
        assert_eq!(compute_renew_budget_ms(10_000, 12_000, 5_000), None);
        // Released records have no deadline to spend.
        assert_eq!(compute_renew_budget_ms(0, 1, 5_000), None);
    }

    #[test]
    fn test_state_after_acquire() {
        assert_eq!(compute_state_after_acquire(Some(Term(5))), ElectionState::Leading { term: Term(5) });
        assert_eq!(compute_state_after_acquire(None), ElectionState::Standby);
    }

    proptest! {
        #[test]
        fn prop_jitter_bounded(base in 0u64..1_000_000, factor in 0.0f64..1.0, r in any::<f64>()) {
            let delay = compute_jittered_delay_ms(base, factor, r);
            prop_assert!(delay >= base);
            prop_assert!(delay as f64 <= base as f64 * (1.0 + factor) + 1.0);
        }

        #[test]
        fn prop_backoff_within_bounds(attempt in 0u32..100, base in 1u64..10_000, max in 1u64..1_000_000) {
            let delay = compute_backoff_ms(attempt, base, max);
            prop_assert!(delay >= base.min(max.max(base)));
            prop_assert!(delay <= max.max(base));
        }

        #[test]
        fn prop_backoff_monotonic(attempt in 0u32..60, base in 1u64..10_000, max in 1u64..1_000_000) {
            prop_assert!(compute_backoff_ms(attempt, base, max) <= compute_backoff_ms(attempt + 1, base, max));
        }

        #[test]
        fn prop_renew_budget_never_crosses_deadline(deadline in 0u64..1_000_000, now in 0u64..1_000_000, renew in 1u64..100_000) {
            match compute_renew_budget_ms(deadline, now, renew) {
                Some(budget) => {
                    prop_assert!(budget > 0 && budget <= renew);
                    prop_assert!(now + budget <= deadline);
                }
                None => prop_assert!(deadline <= now),
            }
        }

        #[test]
        fn prop_next_term_increases(current in 0u64..u64::MAX) {
            prop_assert!(compute_next_term(Some(current)) > current);
        }
    }
}
