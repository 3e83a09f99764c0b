/*
    vector_clock.rs - Per-author counters for causal ordering

    Entries are kept in a BTreeMap so the serialized form is identical on
    every peer. Comparison:
    - happened-before: every entry <= the other's and at least one is smaller
    - concurrent: neither happened before the other and they differ
*/

use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clock: BTreeMap<PeerId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        VectorClock {
            clock: BTreeMap::new(),
        }
    }

    /// Increment the entry for `peer` and return the new value
    pub fn increment(&mut self, peer: &PeerId) -> u64 {
        let counter = self.clock.entry(peer.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Entry for `peer`, 0 if absent
    pub fn get(&self, peer: &PeerId) -> u64 {
        self.clock.get(peer).copied().unwrap_or(0)
    }

    pub fn set(&mut self, peer: &PeerId, counter: u64) {
        self.clock.insert(peer.clone(), counter);
    }

    /// Per-entry maximum
    pub fn merge(&mut self, other: &VectorClock) {
        for (peer, &counter) in &other.clock {
            let current = self.clock.entry(peer.clone()).or_insert(0);
            *current = (*current).max(counter);
        }
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;

        for (peer, &ours) in &self.clock {
            let theirs = other.get(peer);
            if ours > theirs {
                return false;
            }
            if ours < theirs {
                strictly_less = true;
            }
        }

        // Entries only the other side has
        for (peer, &theirs) in &other.clock {
            if !self.clock.contains_key(peer) && theirs > 0 {
                strictly_less = true;
            }
        }

        strictly_less
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        !self.happened_before(other) && !other.happened_before(self) && self != other
    }

    /// `None` when the clocks are concurrent
    pub fn compare(&self, other: &VectorClock) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.happened_before(other) {
            Some(Ordering::Less)
        } else if other.happened_before(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }

    /// Sum of all entries
    pub fn total(&self) -> u64 {
        self.clock.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, u64)> {
        self.clock.iter().map(|(peer, &counter)| (peer, counter))
    }

    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clock.len()
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(entries: [(&str, u64); N]) -> Self {
        let mut clock = VectorClock::new();
        for (peer, counter) in entries {
            clock.set(&PeerId::from(peer), counter);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_increment_returns_new_value() {
        let mut vc = VectorClock::new();
        let a = PeerId::from("a");
        assert_eq!(vc.increment(&a), 1);
        assert_eq!(vc.increment(&a), 2);
        assert_eq!(vc.get(&PeerId::from("b")), 0);
    }

    #[test]
    fn test_merge_takes_maximum() {
        let mut vc1 = VectorClock::from([("a", 3), ("b", 1)]);
        let vc2 = VectorClock::from([("a", 2), ("b", 4), ("c", 1)]);

        vc1.merge(&vc2);
        assert_eq!(vc1, VectorClock::from([("a", 3), ("b", 4), ("c", 1)]));
    }

    #[test]
    fn test_happened_before_with_missing_entries() {
        let vc1 = VectorClock::from([("a", 1)]);
        let vc2 = VectorClock::from([("a", 1), ("b", 1)]);

        assert!(vc1.happened_before(&vc2));
        assert!(!vc2.happened_before(&vc1));
        assert_eq!(vc1.compare(&vc2), Some(Ordering::Less));
    }

    #[test]
    fn test_concurrent() {
        let vc1 = VectorClock::from([("a", 2), ("b", 1)]);
        let vc2 = VectorClock::from([("a", 1), ("b", 2)]);

        assert!(vc1.is_concurrent(&vc2));
        assert_eq!(vc1.compare(&vc2), None);
        assert!(!vc1.is_concurrent(&vc1.clone()));
    }

    #[test]
    fn test_total_grows_along_happened_before() {
        let earlier = VectorClock::from([("a", 2), ("b", 1)]);
        let later = VectorClock::from([("a", 2), ("b", 1), ("c", 1)]);
        assert!(earlier.happened_before(&later));
        assert!(earlier.total() < later.total());
        assert_eq!(VectorClock::new().total(), 0);
    }

    #[test]
    fn test_serializes_as_sorted_map() {
        let vc = VectorClock::from([("b", 1), ("a", 3)]);
        assert_eq!(serde_json::to_string(&vc).unwrap(), r#"{"a":3,"b":1}"#);
    }

    fn clock_strategy() -> impl Strategy<Value = VectorClock> {
        prop::collection::btree_map("[a-d]", 0u64..6, 0..4).prop_map(|entries| {
            let mut vc = VectorClock::new();
            for (peer, counter) in entries {
                vc.set(&PeerId::new(peer), counter);
            }
            vc
        })
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(base in clock_strategy(), other in clock_strategy()) {
            let mut once = base.clone();
            once.merge(&other);
            let mut twice = once.clone();
            twice.merge(&other);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_is_order_independent(
            base in clock_strategy(),
            x in clock_strategy(),
            y in clock_strategy(),
        ) {
            let mut xy = base.clone();
            xy.merge(&x);
            xy.merge(&y);

            let mut yx = base;
            yx.merge(&y);
            yx.merge(&x);
            prop_assert_eq!(xy, yx);
        }
    }
}
