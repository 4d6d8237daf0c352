//! Webhook intake primitives.
//!
//! This module provides signature verification for webhook payloads
//! (HMAC-SHA256 over the raw request bytes). Unsigned or mis-signed
//! requests must be rejected at the boundary; nothing in the pipeline
//! downstream of the HTTP handler re-checks authenticity.

pub mod signature;

pub use signature::{compute_signature, verify_signature};
