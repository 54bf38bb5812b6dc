//! API response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actors::messages::{MonitorState, ScheduledMonitor, SlotState, StorageStats};
use crate::incident::IncidentPhase;
use crate::monitor::{CheckResult, HttpMethod, Incident, MonitorId};
use crate::stats::DashboardStats;
use crate::storage::UptimeStats;

/// Response for GET /api/v1/health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub storage: String,
    pub observers: usize,
}

/// One scheduled monitor with its incident state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub monitor_id: MonitorId,
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub expected_status: u16,
    pub check_interval: u64,
    pub timeout: u64,

    /// Scheduling state of the probe loop
    pub schedule: SlotState,
    pub skipped_ticks: u64,
    pub last_probe_at: Option<DateTime<Utc>>,

    pub phase: IncidentPhase,
    pub consecutive_failures: usize,
    pub open_incident: Option<Incident>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl MonitorInfo {
    /// Combine scheduler and detector views, the latter may not know the monitor yet
    pub fn new(scheduled: ScheduledMonitor, state: Option<MonitorState>) -> Self {
        let config = scheduled.config;
        let (phase, consecutive_failures, open_incident, last_checked_at) = match state {
            Some(state) => (
                state.phase,
                state.consecutive_failures,
                state.open_incident,
                state.last_checked_at,
            ),
            None => (IncidentPhase::Healthy, 0, None, None),
        };

        Self {
            monitor_id: config.id,
            name: config.name,
            url: config.url,
            method: config.method,
            expected_status: config.expected_status,
            check_interval: config.check_interval,
            timeout: config.timeout,
            schedule: scheduled.state,
            skipped_ticks: scheduled.skipped_ticks,
            last_probe_at: scheduled.last_probe_at,
            phase,
            consecutive_failures,
            open_incident,
            last_checked_at,
        }
    }
}

/// Response for GET /api/v1/monitors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorsResponse {
    pub monitors: Vec<MonitorInfo>,
    pub count: usize,
}

/// Response for GET /api/v1/monitors/:id/checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksResponse {
    pub monitor_id: MonitorId,
    pub checks: Vec<CheckResult>,
    pub count: usize,
}

/// Incident with its duration once resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentInfo {
    #[serde(flatten)]
    pub incident: Incident,
    pub duration_secs: Option<i64>,
}

impl From<Incident> for IncidentInfo {
    fn from(incident: Incident) -> Self {
        Self {
            duration_secs: incident.duration_secs(),
            incident,
        }
    }
}

/// Response for GET /api/v1/monitors/:id/incidents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentsResponse {
    pub monitor_id: MonitorId,
    pub incidents: Vec<IncidentInfo>,
    pub count: usize,
}

/// Response for GET /api/v1/monitors/:id/stats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatsResponse {
    pub hours: i64,
    #[serde(flatten)]
    pub stats: UptimeStats,
}

/// Response for GET /api/v1/stats
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub dashboard: DashboardStats,
    pub storage: Option<StorageStats>,
    pub observers: usize,
}
