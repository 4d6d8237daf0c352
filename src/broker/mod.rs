//! Message broker abstraction between the producer and consumer halves of
//! the pipeline.
//!
//! The broker topic is the only channel between the transformer/publisher
//! and the graph applier; no other coupling exists. The broker client is an
//! explicitly constructed, injected dependency with its own lifecycle (open
//! at startup, closed on shutdown) so tests can substitute a fake.
//!
//! Messages are JSON on the wire:
//!
//! ```json
//! { "messageId": "<event-id>-issue", "body": { "messageType": "CREATE_ENTITY", "payload": { … } } }
//! ```

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MessageId;

pub mod memory;

pub use memory::{DeadLetteredMessage, Delivery, InMemoryBroker, Subscription};

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker connection has been closed.
    #[error("broker is closed")]
    Closed,
}

/// Body of a broker message: the operation and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Operation discriminator. Kept as a string at the wire level so the
    /// consumer can dead-letter unknown types instead of failing to parse.
    #[serde(rename = "messageType")]
    pub message_type: String,

    /// Operation-specific payload.
    pub payload: serde_json::Value,
}

/// A message as carried by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Deterministic identifier derived from the originating event;
    /// duplicates indicate broker-level redelivery.
    #[serde(rename = "messageId")]
    pub message_id: MessageId,

    /// The message body.
    pub body: MessageBody,
}

/// Seam through which the producer side hands messages to a broker.
///
/// Implemented by [`InMemoryBroker`]; a deployment against a real broker
/// implements this over its client. Tests inject failing implementations to
/// exercise the retry path.
pub trait MessagePublisher: Send + Sync {
    /// The error type returned by this publisher.
    type Error: std::fmt::Display + Send;

    /// Hands one message to the broker.
    fn publish(
        &self,
        message: BrokerMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventId;

    #[test]
    fn wire_format_uses_camel_case_keys() {
        let message = BrokerMessage {
            message_id: MessageId::derived(&EventId::new("evt-1"), "issue"),
            body: MessageBody {
                message_type: "CREATE_ENTITY".to_string(),
                payload: serde_json::json!({ "id": "JIRA-1" }),
            },
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["messageId"], "evt-1-issue");
        assert_eq!(json["body"]["messageType"], "CREATE_ENTITY");
        assert_eq!(json["body"]["payload"]["id"], "JIRA-1");
    }

    #[test]
    fn wire_format_roundtrips() {
        let message = BrokerMessage {
            message_id: MessageId::new("m-1"),
            body: MessageBody {
                message_type: "LINK_ENTITIES".to_string(),
                payload: serde_json::json!({
                    "sourceEntityId": "JIRA-1",
                    "targetEntityId": "u1",
                    "relationshipType": "REPORTED_BY"
                }),
            },
        };

        let json = serde_json::to_string(&message).unwrap();
        let parsed: BrokerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }
}
