//! Metrics aggregator
//!
//! Uptime statistics are computed from persisted check results at query
//! time. Per-monitor results for the default window are cached and dropped
//! whenever the detector publishes `stats_invalidated` for that monitor, with
//! a TTL as a backstop for results that reach storage only after the event.
//!
//! The dashboard keeps no cache of its own. It is assembled from the
//! per-monitor entries on every request, so invalidating one monitor also
//! refreshes the global summary and no separate global event is needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::actors::messages::MonitorEvent;
use crate::monitor::MonitorId;
use crate::registry::MonitorRegistry;
use crate::storage::schema::round2;
use crate::storage::{StorageBackend, StorageResult, UptimeStats};

/// Default lookback window
pub const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Cached entries older than this are recomputed
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Summary row of one monitor on the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub monitor_id: MonitorId,
    pub name: String,
    pub url: String,
    pub is_active: bool,
    pub uptime_percentage: f64,
    pub avg_response_time_ms: Option<f64>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_check_success: Option<bool>,
    pub ongoing_incidents: u64,
}

/// Dashboard summary over all monitors
#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub total_monitors: usize,
    pub active_monitors: usize,
    pub inactive_monitors: usize,
    /// Active monitors whose last check succeeded
    pub monitors_up: usize,
    /// Active monitors whose last check failed
    pub monitors_down: usize,
    pub total_incidents: u64,
    pub ongoing_incidents: u64,
    /// Mean uptime of all monitors, 100 without monitors
    pub overall_uptime: f64,
    pub monitors: Vec<MonitorSummary>,
    pub generated_at: DateTime<Utc>,
}

pub struct StatsCache {
    backend: Arc<dyn StorageBackend>,
    registry: Arc<dyn MonitorRegistry>,
    window: chrono::Duration,
    entries: RwLock<HashMap<MonitorId, (Instant, UptimeStats)>>,
}

impl StatsCache {
    pub fn new(backend: Arc<dyn StorageBackend>, registry: Arc<dyn MonitorRegistry>) -> Self {
        Self {
            backend,
            registry,
            window: chrono::Duration::hours(DEFAULT_WINDOW_HOURS),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Statistics of one monitor over the default window
    pub async fn monitor_stats(&self, monitor_id: MonitorId) -> StorageResult<UptimeStats> {
        if let Some((computed_at, stats)) = self.entries.read().await.get(&monitor_id)
            && computed_at.elapsed() < CACHE_TTL
        {
            trace!("stats cache hit for monitor {monitor_id}");
            return Ok(stats.clone());
        }

        let stats = self
            .backend
            .uptime(monitor_id, Utc::now() - self.window)
            .await?;
        self.entries
            .write()
            .await
            .insert(monitor_id, (Instant::now(), stats.clone()));
        Ok(stats)
    }

    /// Statistics over a custom window, never cached
    pub async fn monitor_stats_for(
        &self,
        monitor_id: MonitorId,
        hours: i64,
    ) -> StorageResult<UptimeStats> {
        if hours == DEFAULT_WINDOW_HOURS {
            return self.monitor_stats(monitor_id).await;
        }
        self.backend
            .uptime(monitor_id, Utc::now() - chrono::Duration::hours(hours))
            .await
    }

    pub async fn invalidate(&self, monitor_id: MonitorId) {
        if self.entries.write().await.remove(&monitor_id).is_some() {
            trace!("invalidated stats of monitor {monitor_id}");
        }
    }

    /// Summary over every registered monitor
    pub async fn dashboard(&self) -> anyhow::Result<DashboardStats> {
        let monitors = self
            .registry
            .list_monitors()
            .await
            .context("failed to list monitors")?;

        let mut summary = DashboardStats {
            total_monitors: monitors.len(),
            active_monitors: 0,
            inactive_monitors: 0,
            monitors_up: 0,
            monitors_down: 0,
            total_incidents: 0,
            ongoing_incidents: 0,
            overall_uptime: 100.0,
            monitors: Vec::with_capacity(monitors.len()),
            generated_at: Utc::now(),
        };

        let mut uptime_sum = 0.0;
        for monitor in monitors {
            let stats = self
                .monitor_stats(monitor.id)
                .await
                .with_context(|| format!("failed to compute stats of monitor {}", monitor.id))?;

            if monitor.is_active {
                summary.active_monitors += 1;
                match stats.last_check_success {
                    Some(true) => summary.monitors_up += 1,
                    Some(false) => summary.monitors_down += 1,
                    None => {}
                }
            } else {
                summary.inactive_monitors += 1;
            }

            summary.total_incidents += stats.total_incidents;
            summary.ongoing_incidents += stats.ongoing_incidents;
            uptime_sum += stats.uptime_percentage;

            summary.monitors.push(MonitorSummary {
                monitor_id: monitor.id,
                name: monitor.name,
                url: monitor.url,
                is_active: monitor.is_active,
                uptime_percentage: stats.uptime_percentage,
                avg_response_time_ms: stats.avg_response_time_ms,
                last_check_at: stats.last_check_at,
                last_check_success: stats.last_check_success,
                ongoing_incidents: stats.ongoing_incidents,
            });
        }

        if !summary.monitors.is_empty() {
            summary.overall_uptime = round2(uptime_sum / summary.monitors.len() as f64);
        }

        Ok(summary)
    }

    /// Drop cache entries whenever the detector invalidates them
    pub fn spawn_invalidation(
        self: &Arc<Self>,
        mut event_rx: broadcast::Receiver<MonitorEvent>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(MonitorEvent::StatsInvalidated { monitor_id, .. }) => {
                        cache.invalidate(monitor_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("stats invalidation lagged by {skipped} events, clearing cache");
                        cache.entries.write().await.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("event channel closed, stopping stats invalidation");
                        break;
                    }
                }
            }
        })
    }
}
