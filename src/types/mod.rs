//! Core domain types for the sync pipeline.
//!
//! This module contains the fundamental identifier types used throughout the
//! application, designed to encode invariants via the type system.

pub mod ids;

// Re-export commonly used types at the module level
pub use ids::{ConfigId, EntityId, EventId, MessageId, TenantId};
