//! CRDT models for Tandem.
//!
//! The storage stack never inspects CRDT state directly. It relies on the
//! [`CrdtModel`] contract: merge another replica's data, apply a single
//! operation, and expose a consumer view. This crate defines that contract and
//! the models the stack ships with.
//!
//! # Key Types
//!
//! - [`CrdtModel`] -- The contract every synchronized model implements
//! - [`CrdtChange`] / [`MergeChanges`] -- What changed on each side of a merge
//! - [`CrdtSet`] -- Observed-remove set keyed by element id
//! - [`CrdtSingleton`] -- Single-valued register built on set data
//! - [`CrdtCount`] -- Per-actor counter
//! - [`CrdtEntity`] -- Record of named singleton and collection fields
//! - [`CrdtContainer`] -- A set or a singleton, chosen at construction
//! - [`RawEntity`] / [`Reference`] -- The values moved through reference-mode storage

pub mod container;
pub mod count;
pub mod entity;
pub mod model;
pub mod set;
pub mod singleton;
pub mod value;

pub use container::{ContainerData, ContainerKind, ContainerOp, ContainerValue, CrdtContainer};
pub use count::{CountData, CountOp, CrdtCount};
pub use entity::{CrdtEntity, EntityData, EntityOp};
pub use model::{CrdtChange, CrdtData, CrdtModel, CrdtOperation, MergeChanges};
pub use set::{CrdtSet, DataValue, Element, SetData, SetOp};
pub use singleton::{CrdtSingleton, SingletonOp};
pub use value::{FieldValue, RawEntity, Referencable, Reference};
