//! HTTP server for the sync pipeline.
//!
//! This module implements the HTTP server that:
//! - Accepts webhooks from the upstream tool, verifies signatures against
//!   the owning configuration, and enqueues them durably
//! - Provides event inspection endpoints for observability
//! - Provides health checks for liveness probes
//!
//! # Endpoints
//!
//! - `POST /webhooks/{config_id}` - Accepts webhook deliveries (returns 202 Accepted)
//! - `GET /api/v1/events/{id}` - Returns a stored event as JSON
//! - `GET /api/v1/metrics` - Returns pipeline counters as JSON
//! - `GET /health` - Returns 200 if the server is running

use std::sync::Arc;

pub mod events;
pub mod health;
pub mod webhook;

pub use events::{event_handler, metrics_handler};
pub use health::health_handler;
pub use webhook::webhook_handler;

use crate::config::ConfigRegistry;
use crate::metrics::PipelineMetrics;
use crate::store::EventStore;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Durable event store the intake writes to.
    store: Arc<EventStore>,

    /// Read-only configuration lookup for secrets and enablement.
    configs: ConfigRegistry,

    /// Fire-and-forget counters.
    metrics: Arc<PipelineMetrics>,
}

impl AppState {
    /// Creates a new `AppState`.
    pub fn new(
        store: Arc<EventStore>,
        configs: ConfigRegistry,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                store,
                configs,
                metrics,
            }),
        }
    }

    /// Returns the event store.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.inner.store
    }

    /// Returns the configuration registry.
    pub fn configs(&self) -> &ConfigRegistry {
        &self.inner.configs
    }

    /// Returns the pipeline metrics.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.inner.metrics
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhooks/{config_id}", post(webhook_handler))
        .route("/api/v1/events/{id}", get(event_handler))
        .route("/api/v1/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
