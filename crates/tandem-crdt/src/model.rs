use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tandem_types::VersionMap;

/// Serializable snapshot of a model's full state.
pub trait CrdtData:
    Clone + fmt::Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The clock covering everything this snapshot contains.
    fn version_map(&self) -> &VersionMap;
}

/// A single change that can be applied to a model.
pub trait CrdtOperation:
    Clone + fmt::Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The clock the operation was minted at.
    fn clock(&self) -> &VersionMap;
}

/// A change record: either a list of operations or a full replacement.
#[derive(Clone, Debug, PartialEq)]
pub enum CrdtChange<D, O> {
    Operations(Vec<O>),
    Data(D),
}

impl<D, O> CrdtChange<D, O> {
    pub fn none() -> Self {
        CrdtChange::Operations(Vec::new())
    }

    /// Only an empty operation list is empty; a data change always carries state.
    pub fn is_empty(&self) -> bool {
        matches!(self, CrdtChange::Operations(ops) if ops.is_empty())
    }
}

/// Outcome of [`CrdtModel::merge`].
///
/// `model_change` describes how the local model moved. `other_change`
/// describes what the other replica is missing; it is empty exactly when the
/// other side already has everything the merged model has.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeChanges<D, O> {
    pub model_change: CrdtChange<D, O>,
    pub other_change: CrdtChange<D, O>,
}

impl<D, O> MergeChanges<D, O> {
    pub fn unchanged() -> Self {
        Self {
            model_change: CrdtChange::none(),
            other_change: CrdtChange::none(),
        }
    }
}

/// A replicated data type the storage stack can synchronize.
///
/// Implementations must make `merge` commutative, associative and idempotent
/// at the level of `data()`, and `apply_operation` must return `false`
/// (leaving state unchanged for that operation) when the operation's clock is
/// not the immediate successor the model expects.
pub trait CrdtModel: Send + 'static {
    type Data: CrdtData;
    type Op: CrdtOperation;
    type Consumer: Clone + fmt::Debug + PartialEq + Eq + Hash + Send + Sync + 'static;

    fn from_data(data: Self::Data) -> Self
    where
        Self: Sized;

    fn data(&self) -> Self::Data;

    fn version_map(&self) -> VersionMap;

    fn merge(&mut self, other: Self::Data) -> MergeChanges<Self::Data, Self::Op>;

    fn apply_operation(&mut self, op: &Self::Op) -> bool;

    /// The application-facing view of the current state.
    fn consumer_view(&self) -> Self::Consumer;
}
