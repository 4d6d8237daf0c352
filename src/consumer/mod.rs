//! Broker consumer: applies domain events to the graph store.
//!
//! A bounded pool of workers drains the broker subscription. Each delivered
//! message is dispatched on its message type and applied idempotently; on
//! success it is acknowledged, on any failure it is dead-lettered
//! immediately with a reason and the originating error text.
//!
//! There is no consumer-side retry count. This is an intentional asymmetry
//! versus the producer side: publish-time failures are typically transient
//! infrastructure errors, while apply-time failures are typically data-shape
//! errors that will not self-resolve on redelivery.
//!
//! # Shutdown
//!
//! Cancelling the token stops workers from picking up new deliveries.
//! Handlers already applying a message finish and settle it; a delivery
//! abandoned between receive and settle is nacked back to the queue by the
//! delivery guard.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::broker::{BrokerMessage, Delivery, Subscription};
use crate::graph::{GraphEntity, GraphRelationship, GraphStore, MappingKey, MappingLedger};
use crate::metrics::PipelineMetrics;
use crate::transform::{
    EntityPayload, MESSAGE_TYPE_CREATE_ENTITY, MESSAGE_TYPE_LINK_ENTITIES, RelationshipPayload,
};
use crate::types::TenantId;

/// Default number of concurrent consumer workers.
pub const DEFAULT_CONSUMER_WORKERS: usize = 4;

/// Errors that make a delivery unrecoverable.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The message type is not one this consumer understands.
    #[error("unknown message type: {message_type}")]
    UnknownMessageType { message_type: String },

    /// The payload did not deserialize into the expected shape.
    #[error("malformed {message_type} payload: {reason}")]
    MalformedPayload {
        message_type: &'static str,
        reason: String,
    },

    /// The graph store rejected the operation.
    #[error("graph store error: {reason}")]
    Graph { reason: String },
}

impl ApplyError {
    /// Short machine-meaningful tag recorded as the dead-letter reason.
    pub fn reason(&self) -> &'static str {
        match self {
            ApplyError::UnknownMessageType { .. } => "unknown_message_type",
            ApplyError::MalformedPayload { .. } => "malformed_payload",
            ApplyError::Graph { .. } => "graph_apply_failed",
        }
    }
}

/// What applying a message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entity was created and recorded in the ledger.
    EntityCreated,

    /// The ledger already mapped this object; idempotent replay, no-op.
    AlreadyApplied,

    /// A relationship was created (or already existed).
    Linked,
}

/// Tenant/source scope of the subscription this consumer drains.
///
/// The broker topic carries one configured source's events; the ledger key
/// still records the full `(tenant, source, external_id)` identity.
#[derive(Debug, Clone)]
pub struct ConsumerScope {
    pub tenant_id: TenantId,
    pub source: String,
}

/// Applies domain-event messages to the graph store, idempotently.
pub struct GraphApplier<G> {
    graph: Arc<G>,
    ledger: Arc<MappingLedger>,
    scope: ConsumerScope,
}

impl<G: GraphStore> GraphApplier<G> {
    pub fn new(graph: Arc<G>, ledger: Arc<MappingLedger>, scope: ConsumerScope) -> Self {
        GraphApplier {
            graph,
            ledger,
            scope,
        }
    }

    /// Dispatches one message on its type and applies it.
    ///
    /// Safe under concurrent execution for the same external id: the entity
    /// create is idempotent and the ledger insert is first-writer-wins, so
    /// a race resolves to exactly one entity with the loser observing
    /// already-exists.
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn apply(&self, message: &BrokerMessage) -> Result<ApplyOutcome, ApplyError> {
        match message.body.message_type.as_str() {
            MESSAGE_TYPE_CREATE_ENTITY => self.apply_create_entity(message).await,
            MESSAGE_TYPE_LINK_ENTITIES => self.apply_link_entities(message).await,
            other => Err(ApplyError::UnknownMessageType {
                message_type: other.to_string(),
            }),
        }
    }

    async fn apply_create_entity(
        &self,
        message: &BrokerMessage,
    ) -> Result<ApplyOutcome, ApplyError> {
        let payload: EntityPayload = serde_json::from_value(message.body.payload.clone())
            .map_err(|e| ApplyError::MalformedPayload {
                message_type: MESSAGE_TYPE_CREATE_ENTITY,
                reason: e.to_string(),
            })?;

        let key = MappingKey::new(
            self.scope.tenant_id.clone(),
            self.scope.source.clone(),
            payload.id.as_str(),
        );

        // Replay detection: the ledger is consulted before every apply.
        if self.ledger.lookup(&key).is_some() {
            debug!(entity_id = %payload.id, "Entity already applied, no-op");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let entity_id = payload.id.clone();
        self.graph
            .create_entity(GraphEntity {
                id: payload.id,
                entity_type: payload.entity_type,
                name: payload.name,
                metadata: payload.metadata,
            })
            .await
            .map_err(|e| ApplyError::Graph {
                reason: e.to_string(),
            })?;

        // First writer records the mapping; a concurrent loser finding the
        // row present is the same idempotent success.
        if self.ledger.insert_if_absent(key, entity_id.clone()) {
            Ok(ApplyOutcome::EntityCreated)
        } else {
            Ok(ApplyOutcome::AlreadyApplied)
        }
    }

    async fn apply_link_entities(
        &self,
        message: &BrokerMessage,
    ) -> Result<ApplyOutcome, ApplyError> {
        let payload: RelationshipPayload = serde_json::from_value(message.body.payload.clone())
            .map_err(|e| ApplyError::MalformedPayload {
                message_type: MESSAGE_TYPE_LINK_ENTITIES,
                reason: e.to_string(),
            })?;

        self.graph
            .create_relationship(GraphRelationship {
                source: payload.source_entity_id,
                target: payload.target_entity_id,
                relationship_type: payload.relationship_type,
            })
            .await
            .map_err(|e| ApplyError::Graph {
                reason: e.to_string(),
            })?;

        Ok(ApplyOutcome::Linked)
    }
}

/// A bounded worker pool draining a broker subscription into the applier.
pub struct GraphConsumer<G> {
    applier: Arc<GraphApplier<G>>,
    subscription: Subscription,
    metrics: Arc<PipelineMetrics>,
    workers: usize,
}

impl<G: GraphStore + 'static> GraphConsumer<G> {
    pub fn new(
        applier: GraphApplier<G>,
        subscription: Subscription,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        GraphConsumer {
            applier: Arc::new(applier),
            subscription,
            metrics,
            workers: DEFAULT_CONSUMER_WORKERS,
        }
    }

    /// Overrides the worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Runs the pool until the token is cancelled or the broker closes.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(workers = self.workers, "Starting consumer pool");

        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            let applier = Arc::clone(&self.applier);
            let subscription = self.subscription.clone();
            let metrics = Arc::clone(&self.metrics);
            let shutdown = shutdown.clone();

            pool.spawn(async move {
                loop {
                    let delivery = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        delivery = subscription.recv() => match delivery {
                            Some(d) => d,
                            None => break, // broker closed and drained
                        },
                    };

                    handle_delivery(&applier, &metrics, delivery).await;
                }
                debug!(worker, "Consumer worker stopped");
            });
        }

        while let Some(result) = pool.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Consumer worker panicked");
            }
        }
        info!("Consumer pool stopped");
    }
}

/// Applies one delivery and settles it exactly once.
async fn handle_delivery<G: GraphStore>(
    applier: &GraphApplier<G>,
    metrics: &PipelineMetrics,
    delivery: Delivery,
) {
    match applier.apply(delivery.message()).await {
        Ok(outcome) => {
            debug!(
                message_id = %delivery.message().message_id,
                ?outcome,
                "Message applied"
            );
            metrics.record_applied();
            delivery.ack();
        }
        Err(e) => {
            metrics.record_apply_dead_lettered();
            let reason = e.reason();
            let error = e.to_string();
            delivery.dead_letter(reason, error);
        }
    }
}
