//! Foundation types for Tandem.
//!
//! Tandem keeps replicated CRDT models consistent between in-memory proxies
//! and durable storage. This crate holds the identity and addressing types
//! every other Tandem crate depends on.
//!
//! # Key Types
//!
//! - [`Actor`] -- Identity of a participant that mints versions
//! - [`VersionMap`] -- Per-actor logical clock used for causal comparison
//! - [`StorageKey`] -- Address of a storage location (`protocol://location`)
//! - [`ReferenceModeStorageKey`] -- Composite key naming a backing and a container location

pub mod actor;
pub mod error;
pub mod key;
pub mod version;

pub use actor::{Actor, FieldName, ReferenceId};
pub use error::TypeError;
pub use key::{ReferenceModeStorageKey, StorageKey, REFERENCE_MODE_PROTOCOL};
pub use version::VersionMap;
