// ============================================================================
// DELTA ENGINE
// ============================================================================
// Converts two readings of a monotonically increasing counter into the
// activity between them. nginx resets every counter to zero on restart, so a
// current reading below the previous one is taken as the delta itself.
// ============================================================================

use std::collections::BTreeMap;
use std::ops::Sub;

/// Reset-safe difference between two readings of one counter.
///
/// Never negative and never a wrapped-around huge value.
#[inline]
pub fn counter_delta<T>(current: T, previous: T) -> T
where
    T: PartialOrd + Sub<Output = T> + Copy,
{
    if current < previous {
        current
    } else {
        current - previous
    }
}

/// Delta against an optional previous reading. A counter seen for the first
/// time counts from zero.
#[inline]
pub fn counter_delta_from<T>(current: T, previous: Option<T>) -> T
where
    T: PartialOrd + Sub<Output = T> + Copy + Default,
{
    counter_delta(current, previous.unwrap_or_default())
}

/// Field-by-field delta of two keyed counter groups, such as per-interface
/// network counters. Keys only present in `current` count from zero; keys
/// that disappeared are dropped.
pub fn delta_groups(
    current: &BTreeMap<String, BTreeMap<String, f64>>,
    previous: &BTreeMap<String, BTreeMap<String, f64>>,
) -> BTreeMap<String, BTreeMap<String, f64>> {
    current
        .iter()
        .map(|(group, fields)| {
            let prev = previous.get(group);
            let diff = fields
                .iter()
                .map(|(field, value)| {
                    let before = prev.and_then(|p| p.get(field)).copied();
                    (field.clone(), counter_delta_from(*value, before))
                })
                .collect();
            (group.clone(), diff)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_restart_takes_current_value() {
        // nginx restarted between polls: 1234 requests before, 3 after
        assert_eq!(counter_delta(3u64, 1234u64), 3);
        assert_eq!(counter_delta(3.0f64, 1234.0f64), 3.0);
    }

    #[test]
    fn test_steady_increase() {
        assert_eq!(counter_delta(150u64, 100u64), 50);
        assert_eq!(counter_delta(100u64, 100u64), 0);
    }

    #[test]
    fn test_first_sight_counts_from_zero() {
        assert_eq!(counter_delta_from(42u64, None), 42);
        assert_eq!(counter_delta_from(42u64, Some(40)), 2);
    }

    #[test]
    fn test_delta_groups_is_field_by_field() {
        let mut previous = BTreeMap::new();
        previous.insert(
            "eth0".to_string(),
            BTreeMap::from([("bytes_sent".to_string(), 100.0), ("bytes_rcvd".to_string(), 500.0)]),
        );
        let mut current = BTreeMap::new();
        current.insert(
            "eth0".to_string(),
            // bytes_rcvd reset, bytes_sent kept growing
            BTreeMap::from([("bytes_sent".to_string(), 160.0), ("bytes_rcvd".to_string(), 20.0)]),
        );
        current.insert(
            "eth1".to_string(),
            BTreeMap::from([("bytes_sent".to_string(), 7.0)]),
        );

        let diff = delta_groups(&current, &previous);
        assert_eq!(diff["eth0"]["bytes_sent"], 60.0);
        assert_eq!(diff["eth0"]["bytes_rcvd"], 20.0);
        assert_eq!(diff["eth1"]["bytes_sent"], 7.0);
    }

    proptest! {
        #[test]
        fn prop_delta_is_never_negative(prev in 0u64..u64::MAX, cur in 0u64..u64::MAX) {
            let delta = counter_delta(cur, prev);
            if cur >= prev {
                prop_assert_eq!(delta, cur - prev);
            } else {
                prop_assert_eq!(delta, cur);
            }
            prop_assert!(delta <= cur);
        }

        #[test]
        fn prop_float_delta_is_never_negative(prev in 0.0f64..1e15, cur in 0.0f64..1e15) {
            prop_assert!(counter_delta(cur, prev) >= 0.0);
        }
    }
}
