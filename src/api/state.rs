//! API shared state containing actor handles

use std::sync::Arc;

use crate::actors::{
    broadcaster::BroadcasterHandle, detector::DetectorHandle, scheduler::SchedulerHandle,
    storage::StorageHandle,
};
use crate::config::LiveConfig;
use crate::registry::MonitorRegistry;
use crate::stats::StatsCache;
use crate::storage::StorageBackend;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Scheduling state of the active monitors
    pub scheduler: SchedulerHandle,

    /// Incident state, manual resolution
    pub detector: DetectorHandle,

    /// Live observer registry
    pub broadcaster: BroadcasterHandle,

    /// Write-side statistics
    pub storage: StorageHandle,

    /// Read side of the persisted history
    pub backend: Arc<dyn StorageBackend>,

    pub registry: Arc<dyn MonitorRegistry>,

    pub stats: Arc<StatsCache>,

    /// Heartbeat settings of observer connections
    pub live: LiveConfig,
}
