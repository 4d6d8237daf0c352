//! Idempotency ledger mapping upstream objects to graph entities.
//!
//! The ledger records `(tenant, source, external_id) → entity_id` on the
//! first successful apply of a create-entity message. It is read before
//! every apply to detect replays, and its insert is first-writer-wins so a
//! race between two concurrent deliveries of the same id resolves to
//! exactly one entity.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{EntityId, TenantId};

/// Unique key of a ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub tenant_id: TenantId,
    pub source: String,
    pub external_id: String,
}

impl MappingKey {
    pub fn new(
        tenant_id: TenantId,
        source: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        MappingKey {
            tenant_id,
            source: source.into(),
            external_id: external_id.into(),
        }
    }
}

/// Persisted mapping from upstream object identity to graph entity id,
/// unique on its key.
#[derive(Debug, Default)]
pub struct MappingLedger {
    mappings: Mutex<HashMap<MappingKey, EntityId>>,
}

impl MappingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mapped entity id, if this object was applied before.
    pub fn lookup(&self, key: &MappingKey) -> Option<EntityId> {
        self.mappings
            .lock()
            .expect("mapping ledger lock poisoned")
            .get(key)
            .cloned()
    }

    /// Inserts the mapping unless the key is already present.
    ///
    /// Returns `true` if this caller created the row, `false` if another
    /// writer got there first (the insert-on-conflict-do-nothing idiom).
    pub fn insert_if_absent(&self, key: MappingKey, entity_id: EntityId) -> bool {
        let mut mappings = self
            .mappings
            .lock()
            .expect("mapping ledger lock poisoned");
        match mappings.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(entity_id);
                true
            }
        }
    }

    /// Number of mappings recorded.
    pub fn len(&self) -> usize {
        self.mappings
            .lock()
            .expect("mapping ledger lock poisoned")
            .len()
    }

    /// Returns true if the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
