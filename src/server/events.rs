//! Event inspection endpoints for observability.
//!
//! Read-only views of stored events (including dead-letter records) and the
//! pipeline counters. This is the operator surface for distinguishing
//! completed, retrying, and dead-lettered events.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use super::AppState;
use crate::metrics::MetricsSnapshot;
use crate::store::SyncEvent;
use crate::types::EventId;

/// Errors that can occur when fetching an event.
#[derive(Debug, Error)]
pub enum EventFetchError {
    /// No event stored under this id.
    #[error("event not found: {0}")]
    NotFound(EventId),
}

impl IntoResponse for EventFetchError {
    fn into_response(self) -> Response {
        match &self {
            EventFetchError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()).into_response(),
        }
    }
}

/// Event inspection handler.
///
/// Returns the full persisted event as JSON, including the dead-letter
/// record when the event failed terminally.
///
/// # Response
///
/// - 200 OK with the `SyncEvent` as JSON
/// - 404 Not Found if no event exists under the id
pub async fn event_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SyncEvent>, EventFetchError> {
    let id = EventId::new(id);
    app_state
        .store()
        .get(&id)
        .map(Json)
        .ok_or(EventFetchError::NotFound(id))
}

/// Metrics snapshot handler.
///
/// Returns the fire-and-forget pipeline counters as JSON.
pub async fn metrics_handler(State(app_state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(app_state.metrics().snapshot())
}
