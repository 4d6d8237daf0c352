//! Webhook sync configurations and the registry the pipeline reads them from.
//!
//! A [`SyncConfiguration`] is a tenant-scoped webhook registration: it names
//! the upstream source, carries the shared secret used for signature
//! verification, and sets the retry budget for events it owns. Configurations
//! are created by an operator through the configuration service; this
//! pipeline only ever reads them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ConfigId, TenantId};

/// Fallback retry limit used when an event's owning configuration has been
/// deleted by the time a failure is recorded.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// A tenant-scoped webhook registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfiguration {
    /// Identifier the webhook URL path carries.
    pub id: ConfigId,

    /// Tenant that owns this registration.
    pub tenant_id: TenantId,

    /// Tag naming the upstream source system (e.g., "jira").
    pub source: String,

    /// Shared secret for HMAC-SHA256 signature verification.
    pub secret: String,

    /// Maximum number of retries before an event is dead-lettered.
    /// Invariant: never negative (enforced by the unsigned type).
    pub retry_limit: u32,

    /// Minimum delay before a failed event becomes eligible for re-lease.
    /// Zero means eligible again on the next poll tick.
    #[serde(default)]
    pub retry_delay_secs: u64,

    /// Whether this registration accepts webhooks at all.
    pub enabled: bool,
}

impl SyncConfiguration {
    /// Creates an enabled configuration with the default retry budget and no
    /// retry delay.
    pub fn new(
        id: ConfigId,
        tenant_id: TenantId,
        source: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        SyncConfiguration {
            id,
            tenant_id,
            source: source.into(),
            secret: secret.into(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay_secs: 0,
            enabled: true,
        }
    }

    /// Sets the retry limit.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_secs = delay.as_secs();
        self
    }

    /// Disables the configuration.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns the retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Read-only (to the pipeline) lookup service for sync configurations.
///
/// The registry is seeded at startup; the configuration service that writes
/// it lives outside this process. Cloning is cheap and shares the backing
/// map.
#[derive(Debug, Clone, Default)]
pub struct ConfigRegistry {
    configs: Arc<RwLock<HashMap<ConfigId, SyncConfiguration>>>,
}

impl ConfigRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry seeded with the given configurations.
    pub fn with_configs(configs: impl IntoIterator<Item = SyncConfiguration>) -> Self {
        let map = configs.into_iter().map(|c| (c.id.clone(), c)).collect();
        ConfigRegistry {
            configs: Arc::new(RwLock::new(map)),
        }
    }

    /// Looks up a configuration by id.
    pub fn get(&self, id: &ConfigId) -> Option<SyncConfiguration> {
        self.configs
            .read()
            .expect("config registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Inserts or replaces a configuration.
    ///
    /// Used by startup seeding and by tests that simulate configuration
    /// changes mid-flight.
    pub fn insert(&self, config: SyncConfiguration) {
        self.configs
            .write()
            .expect("config registry lock poisoned")
            .insert(config.id.clone(), config);
    }

    /// Removes a configuration, returning it if present.
    pub fn remove(&self, id: &ConfigId) -> Option<SyncConfiguration> {
        self.configs
            .write()
            .expect("config registry lock poisoned")
            .remove(id)
    }

    /// Returns the number of registered configurations.
    pub fn len(&self) -> usize {
        self.configs
            .read()
            .expect("config registry lock poisoned")
            .len()
    }

    /// Returns true if no configurations are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
