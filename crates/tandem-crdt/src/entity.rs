use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tandem_types::{Actor, FieldName, VersionMap};

use crate::model::{CrdtChange, CrdtData, CrdtModel, CrdtOperation, MergeChanges};
use crate::set::{merge_set_data, DataValue, SetData, SetOp};
use crate::singleton::SingletonOp;
use crate::value::{FieldValue, RawEntity};

/// State of a [`CrdtEntity`]: one set-shaped CRDT per field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityData {
    pub version_map: VersionMap,
    pub singletons: BTreeMap<FieldName, SetData<FieldValue>>,
    pub collections: BTreeMap<FieldName, SetData<FieldValue>>,
}

impl CrdtData for EntityData {
    fn version_map(&self) -> &VersionMap {
        &self.version_map
    }
}

impl EntityData {
    /// Build entity data from a raw entity, stamping the entity with
    /// `version_map` and each field with the clock `field_version` returns.
    pub fn from_raw(
        raw: &RawEntity,
        version_map: VersionMap,
        field_version: impl Fn(&str) -> VersionMap,
    ) -> Self {
        let singletons = raw
            .singletons
            .iter()
            .map(|(field, value)| {
                let clock = field_version(field);
                let mut data = SetData {
                    version_map: clock.clone(),
                    values: BTreeMap::new(),
                };
                if let Some(value) = value {
                    data.insert(DataValue::new(clock, value.clone()));
                }
                (field.clone(), data)
            })
            .collect();
        let collections = raw
            .collections
            .iter()
            .map(|(field, values)| {
                let clock = field_version(field);
                let mut data = SetData {
                    version_map: clock.clone(),
                    values: BTreeMap::new(),
                };
                for value in values {
                    data.insert(DataValue::new(clock.clone(), value.clone()));
                }
                (field.clone(), data)
            })
            .collect();
        Self {
            version_map,
            singletons,
            collections,
        }
    }

    pub fn to_raw(&self, id: &str) -> RawEntity {
        RawEntity {
            id: id.to_string(),
            singletons: self
                .singletons
                .iter()
                .map(|(field, data)| {
                    (field.clone(), data.values.values().next().map(|v| v.value.clone()))
                })
                .collect(),
            collections: self
                .collections
                .iter()
                .map(|(field, data)| {
                    (field.clone(), data.values.values().map(|v| v.value.clone()).collect())
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityOp {
    SetSingleton { actor: Actor, clock: VersionMap, field: FieldName, value: FieldValue },
    ClearSingleton { actor: Actor, clock: VersionMap, field: FieldName },
    AddToSet { actor: Actor, clock: VersionMap, field: FieldName, added: FieldValue },
    RemoveFromSet { actor: Actor, clock: VersionMap, field: FieldName, removed: FieldValue },
    /// Clear every field of everything the clock covers.
    ClearAll { actor: Actor, clock: VersionMap },
}

impl CrdtOperation for EntityOp {
    fn clock(&self) -> &VersionMap {
        match self {
            EntityOp::SetSingleton { clock, .. }
            | EntityOp::ClearSingleton { clock, .. }
            | EntityOp::AddToSet { clock, .. }
            | EntityOp::RemoveFromSet { clock, .. }
            | EntityOp::ClearAll { clock, .. } => clock,
        }
    }
}

/// A record of named singleton and collection fields.
///
/// Fields are created on first write; merging two entities keeps the union of
/// their fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CrdtEntity {
    data: EntityData,
}

impl CrdtEntity {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_fields(
    mine: &mut BTreeMap<FieldName, SetData<FieldValue>>,
    theirs: &BTreeMap<FieldName, SetData<FieldValue>>,
) {
    for (field, other) in theirs {
        match mine.get_mut(field) {
            Some(data) => {
                merge_set_data(data, other);
            }
            None => {
                mine.insert(field.clone(), other.clone());
            }
        }
    }
}

impl CrdtModel for CrdtEntity {
    type Data = EntityData;
    type Op = EntityOp;
    type Consumer = RawEntity;

    fn from_data(data: EntityData) -> Self {
        Self { data }
    }

    fn data(&self) -> EntityData {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version_map.clone()
    }

    fn merge(&mut self, other: EntityData) -> MergeChanges<EntityData, EntityOp> {
        let mut merged = self.data.clone();
        merge_fields(&mut merged.singletons, &other.singletons);
        merge_fields(&mut merged.collections, &other.collections);
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

    fn apply_operation(&mut self, op: &EntityOp) -> bool {
        let applied = match op {
            EntityOp::SetSingleton {
                actor,
                clock,
                field,
                value,
            } => SingletonOp::Update {
                actor: actor.clone(),
                clock: clock.clone(),
                value: value.clone(),
            }
            .apply_to(self.data.singletons.entry(field.clone()).or_default()),
            EntityOp::ClearSingleton { actor, clock, field } => SingletonOp::Clear {
                actor: actor.clone(),
                clock: clock.clone(),
            }
            .apply_to(self.data.singletons.entry(field.clone()).or_default()),
            EntityOp::AddToSet {
                actor,
                clock,
                field,
                added,
            } => SetOp::Add {
                actor: actor.clone(),
                clock: clock.clone(),
                added: added.clone(),
            }
            .apply_to(self.data.collections.entry(field.clone()).or_default()),
            EntityOp::RemoveFromSet {
                actor,
                clock,
                field,
                removed,
            } => SetOp::Remove {
                actor: actor.clone(),
                clock: clock.clone(),
                removed: removed.clone(),
            }
            .apply_to(self.data.collections.entry(field.clone()).or_default()),
            EntityOp::ClearAll { clock, .. } => {
                for data in self
                    .data
                    .singletons
                    .values_mut()
                    .chain(self.data.collections.values_mut())
                {
                    data.remove_dominated_by(clock);
                }
                true
            }
        };
        if applied {
            self.data.version_map.merge_in(op.clock());
        }
        applied
    }

    fn consumer_view(&self) -> RawEntity {
        self.data.to_raw("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(actor: &str, version: u64) -> VersionMap {
        [(actor, version)].into_iter().collect()
    }

    fn person(name: &str) -> RawEntity {
        RawEntity::new("p1")
            .with_singleton("name", Some(FieldValue::text(name)))
            .with_collection("tags", [FieldValue::text("friend")])
    }

    #[test]
    fn raw_entity_survives_conversion() {
        let raw = person("bob");
        let data = EntityData::from_raw(&raw, clock("k", 1), |_| clock("k", 1));
        assert_eq!(data.to_raw("p1"), raw);
    }

    #[test]
    fn newer_field_version_wins_on_merge() {
        let old = EntityData::from_raw(&person("bob"), clock("k", 1), |_| clock("k", 1));
        let mut entity = CrdtEntity::from_data(old);
        let newer = EntityData::from_raw(&person("alice"), clock("k", 2), |_| clock("k", 2));
        let changes = entity.merge(newer);
        assert!(!changes.model_change.is_empty());
        assert!(changes.other_change.is_empty());
        assert_eq!(entity.consumer_view().singleton("name"), Some(&FieldValue::text("alice")));
    }

    #[test]
    fn merge_adopts_unknown_fields() {
        let mut entity = CrdtEntity::new();
        let incoming = EntityData::from_raw(&person("bob"), clock("k", 1), |_| clock("k", 1));
        entity.merge(incoming.clone());
        assert_eq!(entity.data(), incoming);
    }

    #[test]
    fn field_operations_follow_field_clocks() {
        let me = Actor::from("me");
        let mut entity = CrdtEntity::new();
        assert!(entity.apply_operation(&EntityOp::SetSingleton {
            actor: me.clone(),
            clock: clock("me", 1),
            field: "name".into(),
            value: FieldValue::text("bob"),
        }));
        assert!(entity.apply_operation(&EntityOp::AddToSet {
            actor: me.clone(),
            clock: clock("me", 1),
            field: "tags".into(),
            added: FieldValue::text("x"),
        }));
        assert!(!entity.apply_operation(&EntityOp::SetSingleton {
            actor: me.clone(),
            clock: clock("me", 1),
            field: "name".into(),
            value: FieldValue::text("again"),
        }));
        let view = entity.consumer_view();
        assert_eq!(view.singleton("name"), Some(&FieldValue::text("bob")));
        assert_eq!(view.collections["tags"].len(), 1);
    }

    #[test]
    fn clear_all_blanks_covered_fields() {
        let data = EntityData::from_raw(&person("bob"), clock("k", 1), |_| clock("k", 1));
        let mut entity = CrdtEntity::from_data(data);
        let version = entity.version_map();
        assert!(entity.apply_operation(&EntityOp::ClearAll {
            actor: Actor::from("k"),
            clock: version,
        }));
        assert!(entity.consumer_view().is_blank());
    }
}
