//! Storage backend trait definition
//!
//! The persistence collaborator as seen from the checker core. Writes are
//! idempotent on their ids so the storage actor may retry them freely.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::StorageResult;
use super::schema::UptimeStats;
use crate::monitor::{CheckResult, Incident, MonitorId};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// Implementations must be `Send + Sync` as they are shared between the
/// storage actor and the query side.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Append a batch of check results
    ///
    /// Results already stored (same `check_id`) are ignored.
    async fn append_check_results(&self, results: Vec<CheckResult>) -> StorageResult<()>;

    /// Persist a freshly opened incident, a no-op if it already exists
    async fn open_incident(&self, incident: &Incident) -> StorageResult<()>;

    /// Mark an incident as resolved
    ///
    /// Resolving an already resolved incident keeps the first resolution time.
    async fn resolve_incident(&self, id: Uuid, resolved_at: DateTime<Utc>) -> StorageResult<()>;

    /// The N most recent check results of a monitor, newest first
    async fn latest_checks(&self, monitor_id: MonitorId, limit: usize)
    -> StorageResult<Vec<CheckResult>>;

    /// Check results since a point in time, oldest first
    async fn checks_since(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<CheckResult>>;

    /// Incidents of a monitor, newest first
    async fn incidents(&self, monitor_id: MonitorId, limit: usize) -> StorageResult<Vec<Incident>>;

    /// All incidents without a resolution time
    async fn open_incidents(&self) -> StorageResult<Vec<Incident>>;

    /// Uptime statistics of a monitor since a point in time
    async fn uptime(&self, monitor_id: MonitorId, since: DateTime<Utc>)
    -> StorageResult<UptimeStats>;

    /// Delete check results older than the given timestamp
    ///
    /// Returns the number of deleted results.
    async fn cleanup_old_checks(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    /// Check backend health
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
