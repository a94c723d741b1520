use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tandem_types::{Actor, VersionMap};

use crate::model::{CrdtChange, CrdtData, CrdtModel, CrdtOperation, MergeChanges};

/// State of a [`CrdtCount`]: each actor's contribution and its version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountData {
    pub version_map: VersionMap,
    pub values: BTreeMap<Actor, i64>,
}

impl CrdtData for CountData {
    fn version_map(&self) -> &VersionMap {
        &self.version_map
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountOp {
    Increment { actor: Actor, clock: VersionMap },
    MultiIncrement { actor: Actor, clock: VersionMap, delta: i64 },
}

impl CrdtOperation for CountOp {
    fn clock(&self) -> &VersionMap {
        match self {
            CountOp::Increment { clock, .. } | CountOp::MultiIncrement { clock, .. } => clock,
        }
    }
}

/// A grow-only counter partitioned by actor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CrdtCount {
    data: CountData,
}

impl CrdtCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_op(&self, actor: &Actor) -> CountOp {
        let mut clock = self.data.version_map.clone();
        clock.increment(actor);
        CountOp::Increment {
            actor: actor.clone(),
            clock,
        }
    }

    pub fn add_op(&self, actor: &Actor, delta: i64) -> CountOp {
        let mut clock = self.data.version_map.clone();
        clock.increment(actor);
        CountOp::MultiIncrement {
            actor: actor.clone(),
            clock,
            delta,
        }
    }
}

impl CrdtModel for CrdtCount {
    type Data = CountData;
    type Op = CountOp;
    type Consumer = i64;

    fn from_data(data: CountData) -> Self {
        Self { data }
    }

    fn data(&self) -> CountData {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }

    fn merge(&mut self, other: CountData) -> MergeChanges<CountData, CountOp> {
        let mut merged = self.data.clone();
        for (actor, value) in &other.values {
            let theirs = other.version_map.get(actor);
            let ours = merged.version_map.get(actor);
            let current = merged.values.get(actor).copied().unwrap_or(0);
            let take_theirs = theirs > ours || (theirs == ours && *value > current);
            if take_theirs {
                merged.values.insert(actor.clone(), *value);
            }
        }
        merged.version_map.merge_in(&other.version_map);

        let model_change = if merged != self.data {
            CrdtChange::Data(merged.clone())
        } else {
            CrdtChange::none()
        };
        let other_change = if merged != other {
            CrdtChange::Data(merged.clone())
        } else {
            CrdtChange::none()
        };
        self.data = merged;
        MergeChanges {
            model_change,
            other_change,
        }
    }

    fn apply_operation(&mut self, op: &CountOp) -> bool {
        let (actor, clock, delta) = match op {
            CountOp::Increment { actor, clock } => (actor, clock, 1),
            CountOp::MultiIncrement { actor, clock, delta } => (actor, clock, *delta),
        };
        if delta < 0 {
            return false;
        }
        let expected = self.data.version_map.get(actor) + 1;
        if clock.get(actor) != expected {
            return false;
        }
        *self.data.values.entry(actor.clone()).or_insert(0) += delta;
        self.data.version_map.set(actor.clone(), expected);
        true
    }

    fn consumer_view(&self) -> i64 {
        self.data.values.values().sum()
    }
}
