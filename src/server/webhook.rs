//! Webhook endpoint handler.
//!
//! Accepts webhook deliveries from the upstream tool, verifies the HMAC
//! signature against the owning configuration's shared secret, and enqueues
//! the event durably before returning 202 Accepted. The actual processing
//! happens asynchronously in the poller.
//!
//! Callers only ever learn accept/reject at intake time; downstream
//! processing outcomes are never reported back.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::store::{NewEvent, StoreError};
use crate::types::{ConfigId, EventId};
use crate::webhooks::verify_signature;

/// Header carrying the hex HMAC-SHA256 signature of the raw body.
const HEADER_SIGNATURE: &str = "x-webhook-signature";

/// Fallback event kind when the payload does not name one.
const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// No configuration registered under this id.
    #[error("unknown configuration: {0}")]
    UnknownConfiguration(ConfigId),

    /// The configuration exists but is switched off.
    #[error("configuration disabled: {0}")]
    ConfigurationDisabled(ConfigId),

    /// Signature header absent or signature does not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid JSON body.
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Event store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            WebhookError::UnknownConfiguration(_) => (StatusCode::NOT_FOUND, self.to_string()),
            WebhookError::ConfigurationDisabled(_) => (StatusCode::FORBIDDEN, self.to_string()),
            WebhookError::InvalidSignature => (StatusCode::UNAUTHORIZED, self.to_string()),
            WebhookError::InvalidJson(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            WebhookError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        (status, message).into_response()
    }
}

/// Response body for an accepted webhook.
#[derive(Debug, Serialize)]
pub struct WebhookAccepted {
    #[serde(rename = "eventId")]
    pub event_id: EventId,
}

/// Webhook handler.
///
/// Accepts webhook deliveries and enqueues them for asynchronous processing.
///
/// # Request
///
/// - Method: POST
/// - Path: `/webhooks/{config_id}`
/// - Required header: `X-Webhook-Signature` — hex HMAC-SHA256 of the raw body
/// - Body: upstream-shaped JSON payload
///
/// # Response
///
/// - 202 Accepted with the generated event id: durably enqueued
/// - 401 Unauthorized: missing or invalid signature
/// - 403 Forbidden: configuration disabled
/// - 404 Not Found: unknown configuration id
/// - 400 Bad Request: body is not JSON
/// - 500 Internal Server Error: store failure
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    Path(config_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAccepted>), WebhookError> {
    let config_id = ConfigId::new(config_id);

    // The configuration supplies the secret, so it must be found before the
    // signature can be checked at all.
    let config = app_state
        .configs()
        .get(&config_id)
        .ok_or_else(|| WebhookError::UnknownConfiguration(config_id.clone()))?;

    if !config.enabled {
        return Err(WebhookError::ConfigurationDisabled(config_id));
    }

    // Verify the signature over the exact raw bytes BEFORE any parsing or
    // persistence. Unsigned or mis-signed events must never enter the store.
    let signature = headers
        .get(HEADER_SIGNATURE)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::InvalidSignature)?;

    if !verify_signature(&body, signature, config.secret.as_bytes()) {
        warn!(config_id = %config_id, "Invalid webhook signature");
        return Err(WebhookError::InvalidSignature);
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)?;

    let event_type = payload
        .get("webhookEvent")
        .and_then(|v| v.as_str())
        .unwrap_or(UNKNOWN_EVENT_TYPE)
        .to_string();

    // The upstream object id, when the payload carries one. The issue key is
    // the canonical external identity; the numeric id is a fallback.
    let external_id = payload
        .pointer("/issue/key")
        .or_else(|| payload.pointer("/issue/id"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    debug!(
        config_id = %config_id,
        event_type = %event_type,
        external_id = ?external_id,
        "Received webhook"
    );

    let event = app_state.store().enqueue(NewEvent {
        config_id,
        tenant_id: config.tenant_id,
        source: config.source,
        event_type: event_type.clone(),
        external_id,
        payload,
    })?;

    app_state.metrics().record_received();
    info!(
        event_id = %event.id,
        event_type = %event_type,
        "Webhook enqueued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted { event_id: event.id }),
    ))
}
