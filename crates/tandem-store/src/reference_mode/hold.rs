use std::collections::BTreeMap;

use tandem_types::{ReferenceId, VersionMap};

/// Identifies one held send.
pub type BlockId = u64;

/// Whether a backing entity at `held` serves a reference needing `required`.
/// The entity must exist; an empty `required` asks for nothing more.
pub fn satisfies(held: &VersionMap, required: &VersionMap) -> bool {
    !held.is_empty() && held.dominates(required)
}

/// Sends waiting for referenced entities to reach the backing store.
///
/// Each block waits on a set of `(id, version)` pairs and is released once the
/// backing store has reported every id at a version that [`satisfies`] the
/// one required.
#[derive(Debug, Default)]
pub struct HoldQueue {
    blocks: BTreeMap<BlockId, BTreeMap<ReferenceId, VersionMap>>,
}

impl HoldQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `block` until every entry in `waiting` is satisfied. An empty
    /// `waiting` is not recorded.
    pub fn hold(&mut self, block: BlockId, waiting: BTreeMap<ReferenceId, VersionMap>) {
        if !waiting.is_empty() {
            self.blocks.insert(block, waiting);
        }
    }

    /// Record that the backing store now holds `id` at `version`. Returns the
    /// blocks this released, in block order.
    pub fn notify(&mut self, id: &str, version: &VersionMap) -> Vec<BlockId> {
        let mut released = Vec::new();
        for (block, waiting) in self.blocks.iter_mut() {
            let satisfied = waiting.get(id).is_some_and(|required| satisfies(version, required));
            if satisfied {
                waiting.remove(id);
            }
            if waiting.is_empty() {
                released.push(*block);
            }
        }
        for block in &released {
            self.blocks.remove(block);
        }
        released
    }

    /// What `block` still waits on.
    pub fn waiting(&self, block: BlockId) -> Option<&BTreeMap<ReferenceId, VersionMap>> {
        self.blocks.get(&block)
    }

    pub fn remove(&mut self, block: BlockId) -> bool {
        self.blocks.remove(&block).is_some()
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains_key(&block)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
