use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_types::{Actor, ReferenceId, VersionMap};

use crate::model::{CrdtChange, CrdtData, CrdtModel, CrdtOperation, MergeChanges};
use crate::value::Referencable;

/// Bound shared by every value stored in set-shaped data.
pub trait Element:
    Referencable
    + Clone
    + fmt::Debug
    + PartialEq
    + Eq
    + Hash
    + Ord
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
}

impl<T> Element for T where
    T: Referencable
        + Clone
        + fmt::Debug
        + PartialEq
        + Eq
        + Hash
        + Ord
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static
{
}

/// A value together with the clock it was added at.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataValue<T> {
    pub version_map: VersionMap,
    pub value: T,
}

impl<T> DataValue<T> {
    pub fn new(version_map: VersionMap, value: T) -> Self {
        Self { version_map, value }
    }
}

/// State of an observed-remove set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct SetData<T> {
    pub version_map: VersionMap,
    pub values: BTreeMap<ReferenceId, DataValue<T>>,
}

impl<T> Default for SetData<T> {
    fn default() -> Self {
        Self {
            version_map: VersionMap::new(),
            values: BTreeMap::new(),
        }
    }
}

impl<T: Element> SetData<T> {
    pub fn insert(&mut self, value: DataValue<T>) {
        self.values.insert(value.value.reference_id(), value);
    }

    /// Drop every value whose clock is covered by `clock`.
    pub(crate) fn remove_dominated_by(&mut self, clock: &VersionMap) {
        self.values.retain(|_, v| !clock.dominates(&v.version_map));
    }
}

impl<T: Element> CrdtData for SetData<T> {
    fn version_map(&self) -> &VersionMap {
        &self.version_map
    }
}

/// Operations on a [`CrdtSet`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub enum SetOp<T> {
    /// Add `added`; `clock[actor]` must be exactly one past the set's version for `actor`.
    Add { actor: Actor, clock: VersionMap, added: T },
    /// Remove `removed`; the clock must equal the set's version for `actor` and
    /// cover the element's clock.
    Remove { actor: Actor, clock: VersionMap, removed: T },
    /// Remove every element the clock covers.
    Clear { actor: Actor, clock: VersionMap },
    /// Bring a replica at `old_clock` up to `new_clock`.
    FastForward {
        old_clock: VersionMap,
        new_clock: VersionMap,
        added: Vec<DataValue<T>>,
        removed: Vec<T>,
    },
}

impl<T: Element> CrdtOperation for SetOp<T> {
    fn clock(&self) -> &VersionMap {
        match self {
            SetOp::Add { clock, .. } | SetOp::Remove { clock, .. } | SetOp::Clear { clock, .. } => {
                clock
            }
            SetOp::FastForward { new_clock, .. } => new_clock,
        }
    }
}

impl<T: Element> SetOp<T> {
    pub fn apply_to(&self, data: &mut SetData<T>) -> bool {
        match self {
            SetOp::Add { actor, clock, added } => {
                let expected = data.version_map.get(actor) + 1;
                if clock.get(actor) != expected {
                    return false;
                }
                data.version_map.set(actor.clone(), expected);
                let id = added.reference_id();
                let version_map = match data.values.get(&id) {
                    Some(previous) => clock.merged(&previous.version_map),
                    None => clock.clone(),
                };
                data.values.insert(id, DataValue::new(version_map, added.clone()));
                true
            }
            SetOp::Remove { actor, clock, removed } => {
                let id = removed.reference_id();
                let Some(existing) = data.values.get(&id) else {
                    return false;
                };
                if clock.get(actor) != data.version_map.get(actor) {
                    return false;
                }
                if !clock.dominates(&existing.version_map) {
                    return false;
                }
                data.values.remove(&id);
                true
            }
            SetOp::Clear { actor, clock } => {
                if clock.get(actor) != data.version_map.get(actor) {
                    return false;
                }
                data.remove_dominated_by(clock);
                true
            }
            SetOp::FastForward {
                old_clock,
                new_clock,
                added,
                removed,
            } => {
                if !data.version_map.dominates(old_clock) {
                    return false;
                }
                if data.version_map.dominates(new_clock) {
                    return true;
                }
                for entry in added {
                    let id = entry.value.reference_id();
                    if let Some(existing) = data.values.get_mut(&id) {
                        existing.version_map.merge_in(&entry.version_map);
                    } else if !data.version_map.dominates(&entry.version_map) {
                        data.values.insert(id, entry.clone());
                    }
                }
                for value in removed {
                    let id = value.reference_id();
                    let covered = data
                        .values
                        .get(&id)
                        .is_some_and(|existing| new_clock.dominates(&existing.version_map));
                    if covered {
                        data.values.remove(&id);
                    }
                }
                data.version_map.merge_in(new_clock);
                true
            }
        }
    }

    /// Rewrite a fast-forward as plain adds when it only carries consecutive
    /// additions from a single actor.
    fn simplify(self) -> Vec<SetOp<T>> {
        match self {
            SetOp::FastForward {
                old_clock,
                new_clock,
                mut added,
                removed,
            } => match single_actor_run(&old_clock, &new_clock, &mut added, &removed) {
                Some(actor) => added
                    .into_iter()
                    .map(|entry| SetOp::Add {
                        actor: actor.clone(),
                        clock: entry.version_map,
                        added: entry.value,
                    })
                    .collect(),
                None => vec![SetOp::FastForward {
                    old_clock,
                    new_clock,
                    added,
                    removed,
                }],
            },
            op => vec![op],
        }
    }
}

/// The actor whose consecutive additions fully explain the step from
/// `old_clock` to `new_clock`, if there is exactly one. Sorts `added` by that
/// actor's version as a side effect.
fn single_actor_run<T>(
    old_clock: &VersionMap,
    new_clock: &VersionMap,
    added: &mut [DataValue<T>],
    removed: &[T],
) -> Option<Actor> {
    if !removed.is_empty() || added.is_empty() {
        return None;
    }
    let ahead = new_clock.ahead_of(old_clock);
    let mut actors = ahead.actors();
    let actor = actors.next()?.clone();
    if actors.next().is_some() {
        return None;
    }
    added.sort_by_key(|entry| entry.version_map.get(&actor));
    let mut expected = old_clock.get(&actor);
    for entry in added.iter() {
        expected += 1;
        if entry.version_map.get(&actor) != expected {
            return None;
        }
    }
    let mut expected_clock = old_clock.clone();
    expected_clock.set(actor.clone(), expected);
    (expected_clock == *new_clock).then_some(actor)
}

/// Merge `other` into `data` and compute the fast-forward the other side needs.
pub(crate) fn merge_set_data<T: Element>(
    data: &mut SetData<T>,
    other: &SetData<T>,
) -> (bool, Option<SetOp<T>>) {
    let new_clock = data.version_map.merged(&other.version_map);
    let mut merged = SetData {
        version_map: new_clock.clone(),
        values: BTreeMap::new(),
    };
    let mut added = Vec::new();
    let mut removed = Vec::new();

    for (id, theirs) in &other.values {
        match data.values.get(id) {
            Some(mine) => {
                let version_map = mine.version_map.merged(&theirs.version_map);
                if version_map != theirs.version_map {
                    added.push(DataValue::new(version_map.clone(), mine.value.clone()));
                }
                merged
                    .values
                    .insert(id.clone(), DataValue::new(version_map, mine.value.clone()));
            }
            None if data.version_map.dominates(&theirs.version_map) => {
                removed.push(theirs.value.clone());
            }
            None => {
                merged.values.insert(id.clone(), theirs.clone());
            }
        }
    }
    for (id, mine) in &data.values {
        if !other.values.contains_key(id) && !other.version_map.dominates(&mine.version_map) {
            merged.values.insert(id.clone(), mine.clone());
            added.push(mine.clone());
        }
    }

    let other_stale =
        !added.is_empty() || !removed.is_empty() || !other.version_map.dominates(&new_clock);
    let fast_forward = other_stale.then(|| SetOp::FastForward {
        old_clock: other.version_map.clone(),
        new_clock,
        added,
        removed,
    });
    let changed = merged != *data;
    *data = merged;
    (changed, fast_forward)
}

/// An observed-remove set keyed by element id.
#[derive(Clone, Debug, PartialEq)]
pub struct CrdtSet<T> {
    data: SetData<T>,
}

impl<T> Default for CrdtSet<T> {
    fn default() -> Self {
        Self {
            data: SetData::default(),
        }
    }
}

impl<T: Element> CrdtSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.data.values.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.data.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.values.is_empty()
    }

    /// Build the operation that adds `value` as `actor`'s next change.
    pub fn add_op(&self, actor: &Actor, value: T) -> SetOp<T> {
        let mut clock = self.data.version_map.clone();
        clock.increment(actor);
        SetOp::Add {
            actor: actor.clone(),
            clock,
            added: value,
        }
    }

    pub fn remove_op(&self, actor: &Actor, value: T) -> SetOp<T> {
        SetOp::Remove {
            actor: actor.clone(),
            clock: self.data.version_map.clone(),
            removed: value,
        }
    }

    pub fn clear_op(&self, actor: &Actor) -> SetOp<T> {
        SetOp::Clear {
            actor: actor.clone(),
            clock: self.data.version_map.clone(),
        }
    }
}

impl<T: Element> CrdtModel for CrdtSet<T> {
    type Data = SetData<T>;
    type Op = SetOp<T>;
    type Consumer = BTreeSet<T>;

    fn from_data(data: SetData<T>) -> Self {
        Self { data }
    }

    fn data(&self) -> SetData<T> {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }

    fn merge(&mut self, other: SetData<T>) -> MergeChanges<SetData<T>, SetOp<T>> {
        let (changed, fast_forward) = merge_set_data(&mut self.data, &other);
        MergeChanges {
            model_change: if changed {
                CrdtChange::Data(self.data.clone())
            } else {
                CrdtChange::none()
            },
            other_change: match fast_forward {
                Some(op) => CrdtChange::Operations(op.simplify()),
                None => CrdtChange::none(),
            },
        }
    }

    fn apply_operation(&mut self, op: &SetOp<T>) -> bool {
        op.apply_to(&mut self.data)
    }

    fn consumer_view(&self) -> BTreeSet<T> {
        self.data.values.values().map(|v| v.value.clone()).collect()
    }
}
