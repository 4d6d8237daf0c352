//! Transformation of raw webhook payloads into domain events.
//!
//! The transformer inspects an event's raw payload and emits zero or more
//! domain events for the broker:
//!
//! - one `CREATE_ENTITY` for the primary issue object
//! - if a reporting user is present, a second `CREATE_ENTITY` for the user
//!   plus one `LINK_ENTITIES` relating issue and user with `REPORTED_BY`
//!
//! A payload missing structural prerequisites yields zero events and reports
//! a [`TransformOutcome::Skipped`] naming the missing fields. The event is
//! still processed successfully; the skip is logged and counted, never
//! silent.
//!
//! Message ids are derived deterministically from the source event id
//! (`{event_id}-issue`, `-user`, `-link`) so broker-level redelivery of the
//! same publish attempt is detectable downstream.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::{BrokerMessage, MessageBody};
use crate::store::SyncEvent;
use crate::types::{EntityId, MessageId};

pub mod publisher;

pub use publisher::{DomainEventPublisher, PublishError};

/// Wire value of the create-entity message type.
pub const MESSAGE_TYPE_CREATE_ENTITY: &str = "CREATE_ENTITY";

/// Wire value of the link-entities message type.
pub const MESSAGE_TYPE_LINK_ENTITIES: &str = "LINK_ENTITIES";

/// Relationship tag linking an issue to its reporter.
pub const RELATIONSHIP_REPORTED_BY: &str = "REPORTED_BY";

/// Entity type tag for issues.
pub const ENTITY_TYPE_ISSUE: &str = "issue";

/// Entity type tag for users.
pub const ENTITY_TYPE_USER: &str = "user";

/// Payload of a `CREATE_ENTITY` domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    /// External key of the entity (issue key, account id).
    pub id: EntityId,

    /// Entity type tag.
    #[serde(rename = "type")]
    pub entity_type: String,

    /// Human-readable name (issue summary, display name).
    pub name: String,

    /// Serialized side attributes, when any are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Payload of a `LINK_ENTITIES` domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipPayload {
    pub source_entity_id: EntityId,
    pub target_entity_id: EntityId,
    pub relationship_type: String,
}

/// A domain event produced by the transformer, immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEventBody {
    CreateEntity(EntityPayload),
    LinkEntities(RelationshipPayload),
}

/// One broker-bound instruction derived from a webhook payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub message_id: MessageId,
    pub body: DomainEventBody,
}

impl DomainEvent {
    /// The wire message type string.
    pub fn message_type(&self) -> &'static str {
        match &self.body {
            DomainEventBody::CreateEntity(_) => MESSAGE_TYPE_CREATE_ENTITY,
            DomainEventBody::LinkEntities(_) => MESSAGE_TYPE_LINK_ENTITIES,
        }
    }

    /// Converts the event into its broker wire form.
    pub fn into_message(self) -> BrokerMessage {
        let message_type = self.message_type().to_string();
        let payload = match self.body {
            DomainEventBody::CreateEntity(p) => {
                serde_json::to_value(p).expect("entity payload serializes")
            }
            DomainEventBody::LinkEntities(p) => {
                serde_json::to_value(p).expect("relationship payload serializes")
            }
        };
        BrokerMessage {
            message_id: self.message_id,
            body: MessageBody {
                message_type,
                payload,
            },
        }
    }
}

/// Result of transforming one sync event.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Domain events to publish, in order.
    Events(Vec<DomainEvent>),

    /// Structural prerequisites were absent; nothing to publish. The event
    /// still completes.
    Skipped {
        /// Dotted paths of the fields that were missing.
        missing: Vec<&'static str>,
    },
}

/// Transforms a sync event's raw payload into domain events.
///
/// Prerequisites for the issue entity: `issue.key`, `issue.fields.summary`,
/// and `issue.fields.status.name`. The reporter entity and its link are
/// emitted only when `user.accountId` is present; a missing reporter is not
/// an error.
pub fn transform(event: &SyncEvent) -> TransformOutcome {
    let payload = &event.payload;

    let Some(issue) = payload.get("issue") else {
        debug!(event_id = %event.id, "Payload has no issue object");
        return TransformOutcome::Skipped {
            missing: vec!["issue"],
        };
    };

    let key = issue.get("key").and_then(|k| k.as_str());
    let fields = issue.get("fields");
    let summary = fields
        .and_then(|f| f.get("summary"))
        .and_then(|s| s.as_str());
    let status = fields
        .and_then(|f| f.get("status"))
        .and_then(|s| s.get("name"))
        .and_then(|n| n.as_str());

    let (key, summary, status) = match (key, summary, status) {
        (Some(key), Some(summary), Some(status)) => (key, summary, status),
        _ => {
            let mut missing = Vec::new();
            if key.is_none() {
                missing.push("issue.key");
            }
            if summary.is_none() {
                missing.push("issue.fields.summary");
            }
            if status.is_none() {
                missing.push("issue.fields.status.name");
            }
            debug!(
                event_id = %event.id,
                missing = ?missing,
                "Payload missing transform prerequisites"
            );
            return TransformOutcome::Skipped { missing };
        }
    };

    let mut metadata = serde_json::Map::new();
    metadata.insert("status".to_string(), status.into());
    if let Some(project) = fields
        .and_then(|f| f.get("project"))
        .and_then(|p| p.get("key"))
        .and_then(|k| k.as_str())
    {
        metadata.insert("project".to_string(), project.into());
    }
    if let Some(issue_id) = issue.get("id").and_then(|v| v.as_str()) {
        metadata.insert("issueId".to_string(), issue_id.into());
    }

    let issue_entity = EntityId::new(key);
    let mut events = vec![DomainEvent {
        message_id: MessageId::derived(&event.id, "issue"),
        body: DomainEventBody::CreateEntity(EntityPayload {
            id: issue_entity.clone(),
            entity_type: ENTITY_TYPE_ISSUE.to_string(),
            name: summary.to_string(),
            metadata: Some(serde_json::Value::Object(metadata)),
        }),
    }];

    // Reporter is optional: emit the user entity and the link only when the
    // payload identifies one.
    if let Some(account_id) = payload
        .get("user")
        .and_then(|u| u.get("accountId"))
        .and_then(|a| a.as_str())
    {
        let display_name = payload
            .get("user")
            .and_then(|u| u.get("displayName"))
            .and_then(|d| d.as_str())
            .unwrap_or(account_id);

        let user_entity = EntityId::new(account_id);
        events.push(DomainEvent {
            message_id: MessageId::derived(&event.id, "user"),
            body: DomainEventBody::CreateEntity(EntityPayload {
                id: user_entity.clone(),
                entity_type: ENTITY_TYPE_USER.to_string(),
                name: display_name.to_string(),
                metadata: None,
            }),
        });
        events.push(DomainEvent {
            message_id: MessageId::derived(&event.id, "link"),
            body: DomainEventBody::LinkEntities(RelationshipPayload {
                source_entity_id: issue_entity,
                target_entity_id: user_entity,
                relationship_type: RELATIONSHIP_REPORTED_BY.to_string(),
            }),
        });
    }

    TransformOutcome::Events(events)
}
