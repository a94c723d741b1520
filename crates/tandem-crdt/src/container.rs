use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_types::{Actor, VersionMap};
use tracing::warn;

use crate::model::{CrdtChange, CrdtData, CrdtModel, CrdtOperation, MergeChanges};
use crate::set::{CrdtSet, Element, SetData, SetOp};
use crate::singleton::{CrdtSingleton, SingletonOp};

/// Which shape a [`CrdtContainer`] has.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    Collection,
    Singleton,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub enum ContainerData<T> {
    Collection(SetData<T>),
    Singleton(SetData<T>),
}

impl<T> ContainerData<T> {
    pub fn empty(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::Collection => ContainerData::Collection(SetData::default()),
            ContainerKind::Singleton => ContainerData::Singleton(SetData::default()),
        }
    }

    pub fn kind(&self) -> ContainerKind {
        match self {
            ContainerData::Collection(_) => ContainerKind::Collection,
            ContainerData::Singleton(_) => ContainerKind::Singleton,
        }
    }

    pub fn set_data(&self) -> &SetData<T> {
        match self {
            ContainerData::Collection(data) | ContainerData::Singleton(data) => data,
        }
    }

    pub fn into_set_data(self) -> SetData<T> {
        match self {
            ContainerData::Collection(data) | ContainerData::Singleton(data) => data,
        }
    }

    /// Wrap `data` in the same shape as `self`.
    pub fn with_set_data<U>(&self, data: SetData<U>) -> ContainerData<U> {
        match self {
            ContainerData::Collection(_) => ContainerData::Collection(data),
            ContainerData::Singleton(_) => ContainerData::Singleton(data),
        }
    }
}

impl<T: Element> CrdtData for ContainerData<T> {
    fn version_map(&self) -> &VersionMap {
        &self.set_data().version_map
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub enum ContainerOp<T> {
    Collection(SetOp<T>),
    Singleton(SingletonOp<T>),
}

impl<T: Element> CrdtOperation for ContainerOp<T> {
    fn clock(&self) -> &VersionMap {
        match self {
            ContainerOp::Collection(op) => op.clock(),
            ContainerOp::Singleton(op) => op.clock(),
        }
    }
}

impl<T> ContainerOp<T> {
    pub fn kind(&self) -> ContainerKind {
        match self {
            ContainerOp::Collection(_) => ContainerKind::Collection,
            ContainerOp::Singleton(_) => ContainerKind::Singleton,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContainerValue<T> {
    Collection(BTreeSet<T>),
    Singleton(Option<T>),
}

#[derive(Clone, Debug, PartialEq)]
enum Inner<T> {
    Collection(CrdtSet<T>),
    Singleton(CrdtSingleton<T>),
}

/// A set or a singleton of `T`, fixed at construction.
///
/// Lets one store or proxy type serve both shapes. Data or operations of the
/// other shape are rejected: merges become no-ops and operations fail.
#[derive(Clone, Debug, PartialEq)]
pub struct CrdtContainer<T> {
    inner: Inner<T>,
}

impl<T: Element> CrdtContainer<T> {
    pub fn new(kind: ContainerKind) -> Self {
        let inner = match kind {
            ContainerKind::Collection => Inner::Collection(CrdtSet::new()),
            ContainerKind::Singleton => Inner::Singleton(CrdtSingleton::new()),
        };
        Self { inner }
    }

    pub fn collection() -> Self {
        Self::new(ContainerKind::Collection)
    }

    pub fn singleton() -> Self {
        Self::new(ContainerKind::Singleton)
    }

    pub fn kind(&self) -> ContainerKind {
        match self.inner {
            Inner::Collection(_) => ContainerKind::Collection,
            Inner::Singleton(_) => ContainerKind::Singleton,
        }
    }

    /// Add to a collection or replace a singleton's value.
    pub fn put_op(&self, actor: &Actor, value: T) -> ContainerOp<T> {
        match &self.inner {
            Inner::Collection(set) => ContainerOp::Collection(set.add_op(actor, value)),
            Inner::Singleton(singleton) => {
                ContainerOp::Singleton(singleton.update_op(actor, value))
            }
        }
    }

    /// Remove `value` from a collection; clears a singleton.
    pub fn remove_op(&self, actor: &Actor, value: T) -> ContainerOp<T> {
        match &self.inner {
            Inner::Collection(set) => ContainerOp::Collection(set.remove_op(actor, value)),
            Inner::Singleton(singleton) => ContainerOp::Singleton(singleton.clear_op(actor)),
        }
    }

    pub fn clear_op(&self, actor: &Actor) -> ContainerOp<T> {
        match &self.inner {
            Inner::Collection(set) => ContainerOp::Collection(set.clear_op(actor)),
            Inner::Singleton(singleton) => ContainerOp::Singleton(singleton.clear_op(actor)),
        }
    }
}

fn wrap_changes<T, O>(
    changes: MergeChanges<SetData<T>, O>,
    data: fn(SetData<T>) -> ContainerData<T>,
    op: fn(O) -> ContainerOp<T>,
) -> MergeChanges<ContainerData<T>, ContainerOp<T>> {
    let wrap = |change: CrdtChange<SetData<T>, O>| match change {
        CrdtChange::Data(d) => CrdtChange::Data(data(d)),
        CrdtChange::Operations(ops) => CrdtChange::Operations(ops.into_iter().map(op).collect()),
    };
    MergeChanges {
        model_change: wrap(changes.model_change),
        other_change: wrap(changes.other_change),
    }
}

impl<T: Element> CrdtModel for CrdtContainer<T> {
    type Data = ContainerData<T>;
    type Op = ContainerOp<T>;
    type Consumer = ContainerValue<T>;

    fn from_data(data: ContainerData<T>) -> Self {
        let inner = match data {
            ContainerData::Collection(d) => Inner::Collection(CrdtSet::from_data(d)),
            ContainerData::Singleton(d) => Inner::Singleton(CrdtSingleton::from_data(d)),
        };
        Self { inner }
    }

    fn data(&self) -> ContainerData<T> {
        match &self.inner {
            Inner::Collection(set) => ContainerData::Collection(set.data()),
            Inner::Singleton(singleton) => ContainerData::Singleton(singleton.data()),
        }
    }

    fn version_map(&self) -> VersionMap {
        match &self.inner {
            Inner::Collection(set) => set.version_map(),
            Inner::Singleton(singleton) => singleton.version_map(),
        }
    }

    fn merge(&mut self, other: ContainerData<T>) -> MergeChanges<ContainerData<T>, ContainerOp<T>> {
        let kind = self.kind();
        match (&mut self.inner, other) {
            (Inner::Collection(set), ContainerData::Collection(d)) => {
                wrap_changes(set.merge(d), ContainerData::Collection, ContainerOp::Collection)
            }
            (Inner::Singleton(singleton), ContainerData::Singleton(d)) => {
                wrap_changes(singleton.merge(d), ContainerData::Singleton, ContainerOp::Singleton)
            }
            (_, other) => {
                warn!(
                    expected = ?kind,
                    got = ?other.kind(),
                    "ignoring container data of the wrong shape"
                );
                MergeChanges::unchanged()
            }
        }
    }

    fn apply_operation(&mut self, op: &ContainerOp<T>) -> bool {
        match (&mut self.inner, op) {
            (Inner::Collection(set), ContainerOp::Collection(op)) => set.apply_operation(op),
            (Inner::Singleton(singleton), ContainerOp::Singleton(op)) => {
                singleton.apply_operation(op)
            }
            _ => false,
        }
    }

    fn consumer_view(&self) -> ContainerValue<T> {
        match &self.inner {
            Inner::Collection(set) => ContainerValue::Collection(set.consumer_view()),
            Inner::Singleton(singleton) => ContainerValue::Singleton(singleton.consumer_view()),
        }
    }
}
