//! Health check endpoint for liveness probes.
//!
//! Returns 200 OK while the server is accepting connections. Intended for
//! load balancers and orchestration systems.

use axum::http::StatusCode;

/// Health check handler.
///
/// Returns 200 OK with the text "OK". Deliberately does not inspect the
/// store or broker: liveness means the process is serving, not that the
/// pipeline is idle.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
