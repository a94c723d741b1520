use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_types::{Actor, VersionMap};

use crate::model::{CrdtChange, CrdtModel, CrdtOperation, MergeChanges};
use crate::set::{merge_set_data, DataValue, Element, SetData};

/// Operations on a [`CrdtSingleton`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub enum SingletonOp<T> {
    /// Replace every value the clock covers with `value`.
    Update { actor: Actor, clock: VersionMap, value: T },
    /// Drop every value the clock covers.
    Clear { actor: Actor, clock: VersionMap },
}

impl<T: Element> CrdtOperation for SingletonOp<T> {
    fn clock(&self) -> &VersionMap {
        match self {
            SingletonOp::Update { clock, .. } | SingletonOp::Clear { clock, .. } => clock,
        }
    }
}

impl<T: Element> SingletonOp<T> {
    pub fn apply_to(&self, data: &mut SetData<T>) -> bool {
        match self {
            SingletonOp::Update { actor, clock, value } => {
                let expected = data.version_map.get(actor) + 1;
                if clock.get(actor) != expected {
                    return false;
                }
                data.remove_dominated_by(clock);
                data.insert(DataValue::new(clock.clone(), value.clone()));
                data.version_map.set(actor.clone(), expected);
                true
            }
            SingletonOp::Clear { actor, clock } => {
                if clock.get(actor) != data.version_map.get(actor) {
                    return false;
                }
                data.remove_dominated_by(clock);
                true
            }
        }
    }
}

/// A single-valued register.
///
/// Stored as set data so concurrent updates from different actors are both
/// kept until a later update covers them. The consumer sees the value with the
/// smallest id, which every replica picks identically.
#[derive(Clone, Debug, PartialEq)]
pub struct CrdtSingleton<T> {
    data: SetData<T>,
}

impl<T> Default for CrdtSingleton<T> {
    fn default() -> Self {
        Self {
            data: SetData::default(),
        }
    }
}

impl<T: Element> CrdtSingleton<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_op(&self, actor: &Actor, value: T) -> SingletonOp<T> {
        let mut clock = self.data.version_map.clone();
        clock.increment(actor);
        SingletonOp::Update {
            actor: actor.clone(),
            clock,
            value,
        }
    }

    pub fn clear_op(&self, actor: &Actor) -> SingletonOp<T> {
        SingletonOp::Clear {
            actor: actor.clone(),
            clock: self.data.version_map.clone(),
        }
    }
}

impl<T: Element> CrdtModel for CrdtSingleton<T> {
    type Data = SetData<T>;
    type Op = SingletonOp<T>;
    type Consumer = Option<T>;

    fn from_data(data: SetData<T>) -> Self {
        Self { data }
    }

    fn data(&self) -> SetData<T> {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }

    fn merge(&mut self, other: SetData<T>) -> MergeChanges<SetData<T>, SingletonOp<T>> {
        let (changed, fast_forward) = merge_set_data(&mut self.data, &other);
        MergeChanges {
            model_change: if changed {
                CrdtChange::Data(self.data.clone())
            } else {
                CrdtChange::none()
            },
            other_change: if fast_forward.is_some() {
                CrdtChange::Data(self.data.clone())
            } else {
                CrdtChange::none()
            },
        }
    }

    fn apply_operation(&mut self, op: &SingletonOp<T>) -> bool {
        op.apply_to(&mut self.data)
    }

    fn consumer_view(&self) -> Option<T> {
        self.data.values.values().next().map(|v| v.value.clone())
    }
}
