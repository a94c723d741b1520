use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tandem_types::{FieldName, ReferenceId, StorageKey, VersionMap};

/// Anything that can live in a set: it has a stable identifier.
pub trait Referencable {
    fn reference_id(&self) -> ReferenceId;
}

/// A primitive or reference value stored in an entity field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Reference(Reference),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }
}

impl Referencable for FieldValue {
    fn reference_id(&self) -> ReferenceId {
        match self {
            FieldValue::Text(s) => format!("text:{s}"),
            FieldValue::Int(i) => format!("int:{i}"),
            FieldValue::Bool(b) => format!("bool:{b}"),
            FieldValue::Reference(r) => format!("ref:{}", r.id),
        }
    }
}

/// A pointer to an entity held in another store.
///
/// `version` is the version the referenced entity was written at, when known.
/// Readers that need the entity wait until the referenced store reaches it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub storage_key: StorageKey,
    pub version: Option<VersionMap>,
}

impl Reference {
    pub fn new(
        id: impl Into<ReferenceId>,
        storage_key: StorageKey,
        version: Option<VersionMap>,
    ) -> Self {
        Self {
            id: id.into(),
            storage_key,
            version,
        }
    }
}

impl Referencable for Reference {
    fn reference_id(&self) -> ReferenceId {
        self.id.clone()
    }
}

/// The plain, consumer-facing shape of an entity: an id plus field values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: ReferenceId,
    pub singletons: BTreeMap<FieldName, Option<FieldValue>>,
    pub collections: BTreeMap<FieldName, BTreeSet<FieldValue>>,
}

impl RawEntity {
    pub fn new(id: impl Into<ReferenceId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_singleton(mut self, field: &str, value: Option<FieldValue>) -> Self {
        self.singletons.insert(field.to_string(), value);
        self
    }

    pub fn with_collection(
        mut self,
        field: &str,
        values: impl IntoIterator<Item = FieldValue>,
    ) -> Self {
        self.collections
            .insert(field.to_string(), values.into_iter().collect());
        self
    }

    pub fn singleton(&self, field: &str) -> Option<&FieldValue> {
        self.singletons.get(field).and_then(Option::as_ref)
    }

    /// `true` when no field holds a value.
    pub fn is_blank(&self) -> bool {
        self.singletons.values().all(Option::is_none)
            && self.collections.values().all(BTreeSet::is_empty)
    }
}

impl Referencable for RawEntity {
    fn reference_id(&self) -> ReferenceId {
        self.id.clone()
    }
}
