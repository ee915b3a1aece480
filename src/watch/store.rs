use std::collections::BTreeMap;

use super::diff::EntityClass;

/// Entity id -> raw state string, as reported by the PBX.
pub type Snapshot = BTreeMap<String, String>;

/// Last-known-good snapshot per entity class.
///
/// Only the poll loop writes here, and only by wholesale replacement after a
/// successful fetch. An empty snapshot means "never seeded".
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotStore {
    peers: Snapshot,
    providers: Snapshot,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: EntityClass) -> &Snapshot {
        match class {
            EntityClass::Peer => &self.peers,
            EntityClass::Provider => &self.providers,
        }
    }

    /// Swap in the newest snapshot, returning the previous baseline.
    pub fn replace(&mut self, class: EntityClass, snapshot: Snapshot) -> Snapshot {
        let slot = match class {
            EntityClass::Peer => &mut self.peers,
            EntityClass::Provider => &mut self.providers,
        };
        std::mem::replace(slot, snapshot)
    }

    pub fn is_seeded(&self, class: EntityClass) -> bool {
        !self.get(class).is_empty()
    }
}
