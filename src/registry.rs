//! Monitor registry - the checker's view of configured monitors
//!
//! The registry is owned by whatever manages monitors (a CRUD service, the
//! config file, a database table). The scheduler only ever reads from it:
//!
//! - a periodic `list_active_monitors()` refresh (full snapshot), and
//! - `RegistryChange` notifications pushed when a monitor is created,
//!   edited, toggled or deleted, so changes apply without waiting for the
//!   next refresh.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::monitor::{MonitorConfig, MonitorId};
use crate::storage::StorageError;

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Errors raised while reading the registry
#[derive(Debug)]
pub enum RegistryError {
    /// The registry could not be reached
    Unavailable(String),

    /// The underlying storage failed
    Storage(StorageError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Unavailable(msg) => write!(f, "monitor registry unavailable: {}", msg),
            RegistryError::Storage(err) => write!(f, "monitor registry storage error: {}", err),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Storage(err) => Some(err),
            RegistryError::Unavailable(_) => None,
        }
    }
}

impl From<StorageError> for RegistryError {
    fn from(err: StorageError) -> Self {
        RegistryError::Storage(err)
    }
}

/// A single create/update/toggle/delete notification
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryChange {
    /// Created, edited, activated or deactivated
    Upserted(MonitorConfig),

    /// Deleted
    Removed(MonitorId),
}

impl RegistryChange {
    pub fn monitor_id(&self) -> MonitorId {
        match self {
            RegistryChange::Upserted(config) => config.id,
            RegistryChange::Removed(id) => *id,
        }
    }
}

/// Read side of the monitor registry
#[async_trait]
pub trait MonitorRegistry: Send + Sync {
    /// Snapshot of every monitor with `is_active == true`
    async fn list_active_monitors(&self) -> Result<Vec<MonitorConfig>, RegistryError>;

    /// Every monitor regardless of its active flag (dashboard counts)
    async fn list_monitors(&self) -> Result<Vec<MonitorConfig>, RegistryError>;
}

/// Registry held in memory, seeded from the config file
///
/// Mutations publish a `RegistryChange` to every subscriber.
pub struct InMemoryRegistry {
    monitors: RwLock<BTreeMap<MonitorId, MonitorConfig>>,
    changes: broadcast::Sender<RegistryChange>,
}

impl InMemoryRegistry {
    pub fn new(monitors: impl IntoIterator<Item = MonitorConfig>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            monitors: RwLock::new(monitors.into_iter().map(|m| (m.id, m)).collect()),
            changes,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    /// Create or replace a monitor
    pub async fn upsert(&self, mut config: MonitorConfig) {
        config.updated_at = Utc::now();
        self.monitors.write().await.insert(config.id, config.clone());
        self.publish(RegistryChange::Upserted(config));
    }

    /// Delete a monitor, returns whether it existed
    pub async fn remove(&self, id: MonitorId) -> bool {
        let existed = self.monitors.write().await.remove(&id).is_some();
        if existed {
            self.publish(RegistryChange::Removed(id));
        }
        existed
    }

    /// Toggle the active flag, returns whether the monitor exists
    pub async fn set_active(&self, id: MonitorId, active: bool) -> bool {
        let updated = {
            let mut monitors = self.monitors.write().await;
            monitors.get_mut(&id).map(|config| {
                config.is_active = active;
                config.updated_at = Utc::now();
                config.clone()
            })
        };

        match updated {
            Some(config) => {
                self.publish(RegistryChange::Upserted(config));
                true
            }
            None => false,
        }
    }

    fn publish(&self, change: RegistryChange) {
        // no subscribers is fine, the periodic refresh picks the change up
        if self.changes.send(change).is_err() {
            debug!("registry change published without subscribers");
        }
    }
}

#[async_trait]
impl MonitorRegistry for InMemoryRegistry {
    async fn list_active_monitors(&self) -> Result<Vec<MonitorConfig>, RegistryError> {
        Ok(self
            .monitors
            .read()
            .await
            .values()
            .filter(|m| m.is_active)
            .cloned()
            .collect())
    }

    async fn list_monitors(&self) -> Result<Vec<MonitorConfig>, RegistryError> {
        Ok(self.monitors.read().await.values().cloned().collect())
    }
}
