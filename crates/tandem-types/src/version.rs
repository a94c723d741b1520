use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::actor::Actor;

/// A per-actor logical clock.
///
/// Each actor maps to the number of changes that actor has made. Actors that
/// are absent have an implicit version of zero, and zero entries are never
/// stored, so two maps that describe the same clock always compare equal.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionMap(BTreeMap<Actor, u64>);

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The version recorded for `actor`, zero when absent.
    pub fn get(&self, actor: &Actor) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// Record `version` for `actor`. Setting zero removes the entry.
    pub fn set(&mut self, actor: Actor, version: u64) {
        if version == 0 {
            self.0.remove(&actor);
        } else {
            self.0.insert(actor, version);
        }
    }

    /// Bump `actor` by one and return the new version.
    pub fn increment(&mut self, actor: &Actor) -> u64 {
        let next = self.get(actor) + 1;
        self.0.insert(actor.clone(), next);
        next
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Actor, u64)> {
        self.0.iter().map(|(actor, version)| (actor, *version))
    }

    /// Raise every entry to at least the value in `other`.
    pub fn merge_in(&mut self, other: &VersionMap) {
        for (actor, version) in other.iter() {
            if version > self.get(actor) {
                self.0.insert(actor.clone(), version);
            }
        }
    }

    /// Pointwise maximum of `self` and `other`.
    pub fn merged(&self, other: &VersionMap) -> VersionMap {
        let mut result = self.clone();
        result.merge_in(other);
        result
    }

    /// `true` when `self` has seen everything `other` has: for every actor,
    /// `self[actor] >= other[actor]`.
    pub fn dominates(&self, other: &VersionMap) -> bool {
        other.iter().all(|(actor, version)| self.get(actor) >= version)
    }

    /// `true` when `self` dominates `other` and is ahead for at least one actor.
    pub fn strictly_dominates(&self, other: &VersionMap) -> bool {
        self.dominates(other) && self != other
    }

    /// Entries where `self` is ahead of `other`, keyed by actor with the value
    /// from `self`.
    pub fn ahead_of(&self, other: &VersionMap) -> VersionMap {
        VersionMap(
            self.0
                .iter()
                .filter(|(actor, version)| **version > other.get(actor))
                .map(|(actor, version)| (actor.clone(), *version))
                .collect(),
        )
    }
}

impl fmt::Debug for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (actor, version)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{actor}: {version}")?;
        }
        f.write_str("}")
    }
}

impl<A: Into<Actor>> FromIterator<(A, u64)> for VersionMap {
    fn from_iter<I: IntoIterator<Item = (A, u64)>>(iter: I) -> Self {
        let mut map = VersionMap::new();
        for (actor, version) in iter {
            map.set(actor.into(), version);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vm(entries: &[(&str, u64)]) -> VersionMap {
        entries.iter().map(|(a, v)| (*a, *v)).collect()
    }

    #[test]
    fn absent_actor_is_zero() {
        let map = vm(&[("a", 2)]);
        assert_eq!(map.get(&Actor::from("a")), 2);
        assert_eq!(map.get(&Actor::from("b")), 0);
    }

    #[test]
    fn zero_entries_are_not_stored() {
        let mut map = vm(&[("a", 1)]);
        map.set(Actor::from("a"), 0);
        assert_eq!(map, VersionMap::new());
        assert!(map.is_empty());
    }

    #[test]
    fn increment_starts_from_zero() {
        let mut map = VersionMap::new();
        let me = Actor::from("me");
        assert_eq!(map.increment(&me), 1);
        assert_eq!(map.increment(&me), 2);
        assert_eq!(map.get(&me), 2);
    }

    #[test]
    fn dominance_is_pointwise() {
        let newer = vm(&[("a", 2), ("b", 1)]);
        let older = vm(&[("a", 1)]);
        assert!(newer.dominates(&older));
        assert!(!older.dominates(&newer));
        assert!(newer.dominates(&VersionMap::new()));
        assert!(newer.dominates(&newer));
        assert!(!newer.strictly_dominates(&newer));
        assert!(newer.strictly_dominates(&older));
    }

    #[test]
    fn concurrent_maps_do_not_dominate() {
        let left = vm(&[("a", 2), ("b", 1)]);
        let right = vm(&[("a", 1), ("b", 2)]);
        assert!(!left.dominates(&right));
        assert!(!right.dominates(&left));
        let joined = left.merged(&right);
        assert_eq!(joined, vm(&[("a", 2), ("b", 2)]));
    }

    #[test]
    fn ahead_of_reports_only_newer_actors() {
        let left = vm(&[("a", 3), ("b", 1), ("c", 4)]);
        let right = vm(&[("a", 3), ("b", 2)]);
        assert_eq!(left.ahead_of(&right), vm(&[("c", 4)]));
    }

    #[test]
    fn debug_lists_entries() {
        assert_eq!(format!("{:?}", vm(&[("a", 1), ("b", 2)])), "{a: 1, b: 2}");
    }

    fn arb_map() -> impl Strategy<Value = VersionMap> {
        proptest::collection::btree_map("[a-d]", 0u64..5, 0..4)
            .prop_map(|entries| entries.into_iter().collect())
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_map(), b in arb_map()) {
            prop_assert_eq!(a.merged(&b), b.merged(&a));
        }

        #[test]
        fn merge_is_associative(a in arb_map(), b in arb_map(), c in arb_map()) {
            prop_assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
        }

        #[test]
        fn merge_is_idempotent(a in arb_map()) {
            prop_assert_eq!(a.merged(&a), a);
        }

        #[test]
        fn merge_dominates_both_inputs(a in arb_map(), b in arb_map()) {
            let joined = a.merged(&b);
            prop_assert!(joined.dominates(&a));
            prop_assert!(joined.dominates(&b));
        }
    }
}
