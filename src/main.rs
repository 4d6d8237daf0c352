use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cogni_sync::broker::InMemoryBroker;
use cogni_sync::config::{ConfigRegistry, SyncConfiguration};
use cogni_sync::consumer::{ConsumerScope, GraphApplier, GraphConsumer};
use cogni_sync::graph::{InMemoryGraphStore, MappingLedger};
use cogni_sync::metrics::PipelineMetrics;
use cogni_sync::server::{AppState, build_router};
use cogni_sync::store::EventStore;
use cogni_sync::transform::DomainEventPublisher;
use cogni_sync::types::{ConfigId, TenantId};
use cogni_sync::worker::{EventProcessor, Poller, PollerConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cogni_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Construction-time failures are fatal: the process must not start
    // serving traffic with a half-configured pipeline.
    if let Err(e) = run().await {
        tracing::error!(error = %e, "fatal: pipeline failed to start or shut down cleanly");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = seed_configuration()?;
    let configs = ConfigRegistry::with_configs([config.clone()]);

    let data_dir: PathBuf = std::env::var("COGNI_SYNC_DATA_DIR")
        .unwrap_or_else(|_| "data".to_string())
        .into();
    let store = Arc::new(EventStore::open(data_dir.join("events.log"))?);
    let metrics = Arc::new(PipelineMetrics::new());
    let broker = InMemoryBroker::new();
    let shutdown = CancellationToken::new();

    // Consumer side: worker pool applying broker messages to the graph.
    let graph = Arc::new(InMemoryGraphStore::new());
    let ledger = Arc::new(MappingLedger::new());
    let consumer = GraphConsumer::new(
        GraphApplier::new(
            Arc::clone(&graph),
            Arc::clone(&ledger),
            ConsumerScope {
                tenant_id: config.tenant_id.clone(),
                source: config.source.clone(),
            },
        ),
        broker.subscribe(),
        Arc::clone(&metrics),
    );
    let consumer_task = tokio::spawn(consumer.run(shutdown.child_token()));

    // Producer side: the lease poller.
    let processor = EventProcessor::new(
        Arc::clone(&store),
        configs.clone(),
        DomainEventPublisher::new(Arc::clone(&broker)),
        Arc::clone(&metrics),
    );
    let poller = Poller::new(Arc::clone(&store), processor, PollerConfig::from_env());
    let poller_task = tokio::spawn(poller.run(shutdown.child_token()));

    // HTTP intake.
    let app = build_router(AppState::new(store, configs, metrics));
    let addr: SocketAddr = std::env::var("COGNI_SYNC_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal(shutdown.clone()))
        .await?;

    // Orderly teardown: stop leasing (the poller finishes or releases its
    // in-flight batch), then close the broker so the consumer pool drains
    // the remaining messages and exits.
    shutdown.cancel();
    poller_task.await?;
    broker.close();
    consumer_task.await?;

    tracing::info!("pipeline stopped");
    Ok(())
}

/// Builds the seeded webhook configuration from the environment.
///
/// The shared secret is mandatory; everything else has defaults.
fn seed_configuration() -> Result<SyncConfiguration, Box<dyn std::error::Error>> {
    let secret = std::env::var("COGNI_SYNC_WEBHOOK_SECRET")
        .map_err(|_| "COGNI_SYNC_WEBHOOK_SECRET must be set")?;

    let config_id = std::env::var("COGNI_SYNC_CONFIG_ID").unwrap_or_else(|_| "default".to_string());
    let tenant_id = std::env::var("COGNI_SYNC_TENANT_ID").unwrap_or_else(|_| "default".to_string());
    let source = std::env::var("COGNI_SYNC_SOURCE").unwrap_or_else(|_| "jira".to_string());
    let retry_limit = std::env::var("COGNI_SYNC_RETRY_LIMIT")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(cogni_sync::config::DEFAULT_RETRY_LIMIT);
    let retry_delay_secs = std::env::var("COGNI_SYNC_RETRY_DELAY_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(SyncConfiguration::new(
        ConfigId::new(config_id),
        TenantId::new(tenant_id),
        source,
        secret,
    )
    .with_retry_limit(retry_limit)
    .with_retry_delay(Duration::from_secs(retry_delay_secs)))
}

/// Resolves when a shutdown signal arrives, cancelling the pipeline token.
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
