//! In-memory storage backend (no persistence)
//!
//! This backend keeps check results in a bounded ring buffer per monitor.
//! It's useful for:
//! - Testing without database dependencies
//! - Running the checker without a configured database
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: Oldest results per monitor are evicted

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::UptimeStats;
use crate::monitor::{CheckResult, Incident, MonitorId};

/// Maximum results to keep in memory per monitor
const MAX_CHECKS_PER_MONITOR: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    checks: HashMap<MonitorId, VecDeque<CheckResult>>,
    check_ids: HashSet<Uuid>,
    incidents: HashMap<Uuid, Incident>,
}

/// In-memory storage backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn append_check_results(&self, results: Vec<CheckResult>) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let Inner {
            checks, check_ids, ..
        } = &mut *inner;

        for result in results {
            if !check_ids.insert(result.check_id) {
                trace!("check {} already stored, skipping", result.check_id);
                continue;
            }

            let buffer = checks.entry(result.monitor_id).or_default();
            buffer.push_back(result);
            if buffer.len() > MAX_CHECKS_PER_MONITOR
                && let Some(evicted) = buffer.pop_front()
            {
                check_ids.remove(&evicted.check_id);
            }
        }

        Ok(())
    }

    async fn open_incident(&self, incident: &Incident) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .incidents
            .entry(incident.id)
            .or_insert_with(|| incident.clone());
        Ok(())
    }

    async fn resolve_incident(&self, id: Uuid, resolved_at: DateTime<Utc>) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let incident = inner
            .incidents
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("incident {id}")))?;

        if incident.resolved_at.is_none() {
            incident.resolved_at = Some(resolved_at);
        }
        Ok(())
    }

    async fn latest_checks(
        &self,
        monitor_id: MonitorId,
        limit: usize,
    ) -> StorageResult<Vec<CheckResult>> {
        let inner = self.inner.read().await;
        Ok(inner
            .checks
            .get(&monitor_id)
            .map(|buffer| buffer.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn checks_since(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<CheckResult>> {
        let inner = self.inner.read().await;
        Ok(inner
            .checks
            .get(&monitor_id)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|c| c.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn incidents(&self, monitor_id: MonitorId, limit: usize) -> StorageResult<Vec<Incident>> {
        let inner = self.inner.read().await;
        let mut incidents: Vec<Incident> = inner
            .incidents
            .values()
            .filter(|i| i.monitor_id == monitor_id)
            .cloned()
            .collect();
        incidents.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        incidents.truncate(limit);
        Ok(incidents)
    }

    async fn open_incidents(&self) -> StorageResult<Vec<Incident>> {
        let inner = self.inner.read().await;
        Ok(inner
            .incidents
            .values()
            .filter(|i| i.is_open())
            .cloned()
            .collect())
    }

    async fn uptime(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> StorageResult<UptimeStats> {
        let inner = self.inner.read().await;

        let mut stats = UptimeStats::from_checks(
            monitor_id,
            since,
            inner
                .checks
                .get(&monitor_id)
                .into_iter()
                .flatten()
                .filter(|c| c.timestamp >= since),
        );

        for incident in inner.incidents.values().filter(|i| i.monitor_id == monitor_id) {
            if incident.opened_at >= since {
                stats.total_incidents += 1;
            }
            if incident.is_open() {
                stats.ongoing_incidents += 1;
            }
        }

        Ok(stats)
    }

    async fn cleanup_old_checks(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let Inner {
            checks, check_ids, ..
        } = &mut *inner;

        let mut deleted = 0;
        for buffer in checks.values_mut() {
            buffer.retain(|c| {
                let keep = c.timestamp >= before;
                if !keep {
                    check_ids.remove(&c.check_id);
                    deleted += 1;
                }
                keep
            });
        }

        debug!("in-memory cleanup removed {deleted} check results");
        Ok(deleted)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let inner = self.inner.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_checks".to_string(), inner.check_ids.len().to_string()),
                ("incidents".to_string(), inner.incidents.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
