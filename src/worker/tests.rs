//! End-to-end tests for the producer pipeline: enqueue → lease → transform →
//! publish → outcome, plus the consumer half where a scenario needs it.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerMessage, InMemoryBroker, MessagePublisher};
use crate::config::{ConfigRegistry, SyncConfiguration};
use crate::consumer::{ApplyOutcome, ConsumerScope, GraphApplier, GraphConsumer};
use crate::graph::{InMemoryGraphStore, MappingLedger};
use crate::metrics::PipelineMetrics;
use crate::store::{EventStore, NewEvent, ProcessingStatus};
use crate::transform::{
    DomainEventPublisher, MESSAGE_TYPE_CREATE_ENTITY, MESSAGE_TYPE_LINK_ENTITIES,
};
use crate::types::{ConfigId, TenantId};
use crate::worker::{EventProcessor, Poller, PollerConfig};

fn test_config(retry_limit: u32) -> SyncConfiguration {
    SyncConfiguration::new(
        ConfigId::new("cfg-1"),
        TenantId::new("tenant-1"),
        "jira",
        "test-secret",
    )
    .with_retry_limit(retry_limit)
}

fn issue_created_payload() -> serde_json::Value {
    serde_json::json!({
        "webhookEvent": "issue_created",
        "issue": {
            "id": "1",
            "key": "JIRA-1",
            "fields": {
                "summary": "S",
                "status": { "name": "Open" },
                "project": { "key": "P" }
            }
        },
        "user": { "accountId": "u1", "displayName": "Bob" }
    })
}

fn new_event(payload: serde_json::Value) -> NewEvent {
    NewEvent {
        config_id: ConfigId::new("cfg-1"),
        tenant_id: TenantId::new("tenant-1"),
        source: "jira".to_string(),
        event_type: "issue_created".to_string(),
        external_id: payload
            .pointer("/issue/key")
            .and_then(|k| k.as_str())
            .map(str::to_string),
        payload,
    }
}

/// Producer-side test fixture wired to an in-memory broker.
struct Harness {
    _dir: TempDir,
    store: Arc<EventStore>,
    broker: Arc<InMemoryBroker>,
    metrics: Arc<PipelineMetrics>,
    poller: Poller<InMemoryBroker>,
}

fn harness(retry_limit: u32) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EventStore::open(dir.path().join("store.log")).unwrap());
    let configs = ConfigRegistry::with_configs([test_config(retry_limit)]);
    let broker = InMemoryBroker::new();
    let metrics = Arc::new(PipelineMetrics::new());

    let processor = EventProcessor::new(
        Arc::clone(&store),
        configs,
        DomainEventPublisher::new(Arc::clone(&broker)),
        Arc::clone(&metrics),
    );
    let poller = Poller::new(
        Arc::clone(&store),
        processor,
        PollerConfig {
            interval: Duration::from_millis(10),
            batch_size: 10,
        },
    );

    Harness {
        _dir: dir,
        store,
        broker,
        metrics,
        poller,
    }
}

/// Publisher whose every call fails, for driving the retry machinery.
struct FailingPublisher;

impl MessagePublisher for FailingPublisher {
    type Error = String;

    async fn publish(&self, _message: BrokerMessage) -> Result<(), String> {
        Err("broker unreachable".to_string())
    }
}

/// Producer-side fixture whose publisher always fails.
struct FailingHarness {
    _dir: TempDir,
    store: Arc<EventStore>,
    configs: ConfigRegistry,
    poller: Poller<FailingPublisher>,
}

fn failing_harness(retry_limit: u32) -> FailingHarness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EventStore::open(dir.path().join("store.log")).unwrap());
    let configs = ConfigRegistry::with_configs([test_config(retry_limit)]);
    let metrics = Arc::new(PipelineMetrics::new());

    let processor = EventProcessor::new(
        Arc::clone(&store),
        configs.clone(),
        DomainEventPublisher::new(Arc::new(FailingPublisher)),
        metrics,
    );
    let poller = Poller::new(
        Arc::clone(&store),
        processor,
        PollerConfig {
            interval: Duration::from_millis(10),
            batch_size: 10,
        },
    );

    FailingHarness {
        _dir: dir,
        store,
        configs,
        poller,
    }
}

async fn drain_messages(broker: &Arc<InMemoryBroker>) -> Vec<BrokerMessage> {
    let subscription = broker.subscribe();
    let mut messages = Vec::new();
    while broker.depth() > 0 {
        let delivery = subscription.recv().await.unwrap();
        messages.push(delivery.message().clone());
        delivery.ack();
    }
    messages
}

// ─── Scenario: full issue payload publishes issue, user, and link ───

#[tokio::test]
async fn issue_created_publishes_entities_and_link() {
    let harness = harness(3);
    let event = harness
        .store
        .enqueue(new_event(issue_created_payload()))
        .unwrap();

    let shutdown = CancellationToken::new();
    let processed = harness.poller.run_cycle(&shutdown).await.unwrap();
    assert_eq!(processed, 1);

    let messages = drain_messages(&harness.broker).await;
    assert_eq!(messages.len(), 3);

    assert_eq!(messages[0].body.message_type, MESSAGE_TYPE_CREATE_ENTITY);
    assert_eq!(messages[0].body.payload["id"], "JIRA-1");
    assert_eq!(messages[1].body.message_type, MESSAGE_TYPE_CREATE_ENTITY);
    assert_eq!(messages[1].body.payload["id"], "u1");
    assert_eq!(messages[2].body.message_type, MESSAGE_TYPE_LINK_ENTITIES);
    assert_eq!(messages[2].body.payload["sourceEntityId"], "JIRA-1");
    assert_eq!(messages[2].body.payload["targetEntityId"], "u1");
    assert_eq!(messages[2].body.payload["relationshipType"], "REPORTED_BY");

    // Message ids are derived from the event id.
    assert_eq!(
        messages[0].message_id.as_str(),
        format!("{}-issue", event.id)
    );
    assert_eq!(messages[1].message_id.as_str(), format!("{}-user", event.id));
    assert_eq!(messages[2].message_id.as_str(), format!("{}-link", event.id));

    let stored = harness.store.get(&event.id).unwrap();
    assert_eq!(stored.status, ProcessingStatus::Completed);
    assert_eq!(harness.metrics.snapshot().succeeded, 1);
}

// ─── Scenario: missing prerequisites skip but complete ───

#[tokio::test]
async fn missing_summary_completes_without_publishing() {
    let harness = harness(3);

    let mut payload = issue_created_payload();
    payload["issue"]["fields"]
        .as_object_mut()
        .unwrap()
        .remove("summary");
    let event = harness.store.enqueue(new_event(payload)).unwrap();

    let shutdown = CancellationToken::new();
    harness.poller.run_cycle(&shutdown).await.unwrap();

    assert_eq!(harness.broker.depth(), 0, "nothing published");
    let stored = harness.store.get(&event.id).unwrap();
    assert_eq!(stored.status, ProcessingStatus::Completed);

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.skipped, 1);
    assert_eq!(snapshot.succeeded, 1);
}

// ─── Scenario: three failures under retry_limit = 2 ───

#[tokio::test]
async fn three_failures_walk_retry_retry_dead_letter() {
    let harness = failing_harness(2);
    let event = harness
        .store
        .enqueue(new_event(issue_created_payload()))
        .unwrap();
    let shutdown = CancellationToken::new();

    harness.poller.run_cycle(&shutdown).await.unwrap();
    let after_first = harness.store.get(&event.id).unwrap();
    assert_eq!(after_first.status, ProcessingStatus::Retrying);
    assert_eq!(after_first.retry_count, 1);

    harness.poller.run_cycle(&shutdown).await.unwrap();
    let after_second = harness.store.get(&event.id).unwrap();
    assert_eq!(after_second.status, ProcessingStatus::Retrying);
    assert_eq!(after_second.retry_count, 2);

    harness.poller.run_cycle(&shutdown).await.unwrap();
    let after_third = harness.store.get(&event.id).unwrap();
    assert_eq!(after_third.status, ProcessingStatus::DeadLetter);

    let record = after_third.dead_letter.expect("dead-letter record");
    assert_eq!(record.attempts, 3);
    assert!(record.error.contains("broker unreachable"));
    assert_eq!(record.payload, issue_created_payload());

    // Terminal: further cycles lease nothing.
    assert_eq!(harness.poller.run_cycle(&shutdown).await.unwrap(), 0);
}

// ─── Scenario: redelivered CREATE_ENTITY acknowledges without duplicating ───

#[tokio::test]
async fn redelivered_create_entity_is_applied_once() {
    let harness = harness(3);
    harness
        .store
        .enqueue(new_event(issue_created_payload()))
        .unwrap();

    let shutdown = CancellationToken::new();
    harness.poller.run_cycle(&shutdown).await.unwrap();
    let messages = drain_messages(&harness.broker).await;

    let graph = Arc::new(InMemoryGraphStore::new());
    let applier = GraphApplier::new(
        Arc::clone(&graph),
        Arc::new(MappingLedger::new()),
        ConsumerScope {
            tenant_id: TenantId::new("tenant-1"),
            source: "jira".to_string(),
        },
    );

    // First delivery of the user entity succeeds.
    let user_message = &messages[1];
    assert_eq!(user_message.body.payload["id"], "u1");
    assert_eq!(
        applier.apply(user_message).await.unwrap(),
        ApplyOutcome::EntityCreated
    );

    // Redelivery of the identical message acknowledges as a no-op.
    assert_eq!(
        applier.apply(user_message).await.unwrap(),
        ApplyOutcome::AlreadyApplied
    );
    assert_eq!(graph.entity_count(), 1);
}

// ─── Whole pipeline: webhook event through to graph state ───

#[tokio::test]
async fn pipeline_end_to_end_applies_graph_state() {
    let harness = harness(3);
    harness
        .store
        .enqueue(new_event(issue_created_payload()))
        .unwrap();

    let shutdown = CancellationToken::new();
    harness.poller.run_cycle(&shutdown).await.unwrap();

    let graph = Arc::new(InMemoryGraphStore::new());
    let ledger = Arc::new(MappingLedger::new());
    let consumer = GraphConsumer::new(
        GraphApplier::new(
            Arc::clone(&graph),
            Arc::clone(&ledger),
            ConsumerScope {
                tenant_id: TenantId::new("tenant-1"),
                source: "jira".to_string(),
            },
        ),
        harness.broker.subscribe(),
        Arc::new(PipelineMetrics::new()),
    )
    .with_workers(2);

    let consumer_shutdown = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(consumer_shutdown));

    tokio::time::timeout(Duration::from_secs(5), async {
        while graph.entity_count() < 2 || graph.relationship_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("graph state applied");

    harness.broker.close();
    handle.await.unwrap();

    assert_eq!(graph.entity_count(), 2);
    assert_eq!(graph.relationship_count(), 1);
    assert_eq!(ledger.len(), 2);
    assert!(harness.broker.dead_letters().is_empty());
}

// ─── Lease lifecycle properties ───

#[tokio::test]
async fn no_event_left_in_processing_after_a_cycle() {
    // Success path.
    let ok = harness(3);
    ok.store
        .enqueue(new_event(issue_created_payload()))
        .unwrap();
    ok.poller
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        ok.store.status_counts().get(&ProcessingStatus::Processing),
        None
    );

    // Failure path.
    let failing = failing_harness(3);
    failing
        .store
        .enqueue(new_event(issue_created_payload()))
        .unwrap();
    failing
        .poller
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        failing
            .store
            .status_counts()
            .get(&ProcessingStatus::Processing),
        None
    );
}

#[tokio::test]
async fn cancelled_cycle_releases_leases() {
    let harness = harness(3);
    for _ in 0..3 {
        harness
            .store
            .enqueue(new_event(issue_created_payload()))
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    harness.poller.run_cycle(&shutdown).await.unwrap();

    // Everything leased by the cancelled cycle is back to eligible.
    let counts = harness.store.status_counts();
    assert_eq!(counts.get(&ProcessingStatus::Processing), None);
    assert_eq!(harness.broker.depth(), 0, "nothing was published");

    // A fresh cycle processes all of them.
    let processed = harness
        .poller
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(processed, 3);
}

#[tokio::test]
async fn deleted_configuration_falls_back_to_default_limit() {
    let harness = failing_harness(10);
    let event = harness
        .store
        .enqueue(new_event(issue_created_payload()))
        .unwrap();

    // Delete the configuration before any processing happens.
    harness.configs.remove(&ConfigId::new("cfg-1"));

    let shutdown = CancellationToken::new();
    // Default limit is 3: three retries, dead-letter on the fourth failure.
    for _ in 0..4 {
        harness.poller.run_cycle(&shutdown).await.unwrap();
    }

    let stored = harness.store.get(&event.id).unwrap();
    assert_eq!(stored.status, ProcessingStatus::DeadLetter);
    assert_eq!(stored.dead_letter.unwrap().attempts, 4);
}

#[tokio::test]
async fn poller_run_exits_on_shutdown() {
    let harness = harness(3);
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(harness.poller.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_finished());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("poller exits after shutdown signal")
        .unwrap();
}

#[tokio::test]
async fn batch_continues_past_a_skipped_event() {
    let harness = harness(3);

    // One payload that skips, one that publishes.
    let mut incomplete = issue_created_payload();
    incomplete["issue"].as_object_mut().unwrap().remove("fields");
    let skipped = harness.store.enqueue(new_event(incomplete)).unwrap();
    let good = harness
        .store
        .enqueue(new_event(issue_created_payload()))
        .unwrap();

    harness
        .poller
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        harness.store.get(&skipped.id).unwrap().status,
        ProcessingStatus::Completed
    );
    assert_eq!(
        harness.store.get(&good.id).unwrap().status,
        ProcessingStatus::Completed
    );
    assert_eq!(harness.broker.depth(), 3);
}
