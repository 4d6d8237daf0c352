//! Graph store seam and the in-memory implementation.
//!
//! The graph store sits behind the broker consumer. Both operations are
//! idempotent: creating an entity that already exists and creating a
//! relationship that already exists are successes, which is what lets the
//! consumer tolerate at-least-once delivery.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::types::EntityId;

pub mod ledger;

pub use ledger::{MappingKey, MappingLedger};

/// An entity as stored in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEntity {
    pub id: EntityId,
    pub entity_type: String,
    pub name: String,
    pub metadata: Option<serde_json::Value>,
}

/// A directed, typed relationship between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphRelationship {
    pub source: EntityId,
    pub target: EntityId,
    pub relationship_type: String,
}

/// Interface to the downstream graph-entity store.
///
/// Implementations must make both operations idempotent under re-delivery
/// of the identical input. Tests substitute failing implementations to
/// exercise the consumer's dead-letter path.
pub trait GraphStore: Send + Sync {
    /// The error type returned by this store.
    type Error: std::fmt::Display + Send;

    /// Creates an entity; an entity with the same id already existing is a
    /// success.
    fn create_entity(
        &self,
        entity: GraphEntity,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Creates a relationship; the identical tuple already existing is a
    /// success.
    fn create_relationship(
        &self,
        relationship: GraphRelationship,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Errors from the in-memory graph store.
///
/// The in-memory implementation cannot actually fail; the type exists so
/// the trait's error channel is exercised end to end.
#[derive(Debug, Error)]
pub enum GraphError {}

/// In-memory graph store with unique-keyed maps.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    entities: Mutex<HashMap<EntityId, GraphEntity>>,
    relationships: Mutex<HashSet<GraphRelationship>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entity with the given id, if present.
    pub fn entity(&self, id: &EntityId) -> Option<GraphEntity> {
        self.entities
            .lock()
            .expect("graph entity lock poisoned")
            .get(id)
            .cloned()
    }

    /// Number of entities in the store.
    pub fn entity_count(&self) -> usize {
        self.entities
            .lock()
            .expect("graph entity lock poisoned")
            .len()
    }

    /// Number of relationships in the store.
    pub fn relationship_count(&self) -> usize {
        self.relationships
            .lock()
            .expect("graph relationship lock poisoned")
            .len()
    }

    /// Returns true if the exact relationship tuple exists.
    pub fn has_relationship(&self, relationship: &GraphRelationship) -> bool {
        self.relationships
            .lock()
            .expect("graph relationship lock poisoned")
            .contains(relationship)
    }
}

impl GraphStore for InMemoryGraphStore {
    type Error = GraphError;

    async fn create_entity(&self, entity: GraphEntity) -> Result<(), GraphError> {
        let mut entities = self.entities.lock().expect("graph entity lock poisoned");
        // First write wins; a duplicate create is an idempotent success.
        if !entities.contains_key(&entity.id) {
            debug!(entity_id = %entity.id, entity_type = %entity.entity_type, "Created entity");
            entities.insert(entity.id.clone(), entity);
        }
        Ok(())
    }

    async fn create_relationship(
        &self,
        relationship: GraphRelationship,
    ) -> Result<(), GraphError> {
        let mut relationships = self
            .relationships
            .lock()
            .expect("graph relationship lock poisoned");
        if relationships.insert(relationship.clone()) {
            debug!(
                source = %relationship.source,
                target = %relationship.target,
                relationship_type = %relationship.relationship_type,
                "Created relationship"
            );
        }
        Ok(())
    }
}
