//! Message types for actor communication
//!
//! This module defines all message types used for communication between actors.
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Events**: Broadcast notifications published to multiple subscribers
//! 3. **Immutability**: All messages are cloneable for multi-subscriber patterns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::incident::IncidentPhase;
use crate::monitor::{CheckResult, Incident, MonitorConfig, MonitorId};
use crate::registry::RegistryChange;

/// Event published by the incident detector
///
/// This event is broadcast to all interested actors (StorageActor,
/// BroadcasterActor, the stats cache). The broadcast channel may lag for slow
/// subscribers; live delivery is best-effort by contract.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A probe finished and was applied to the monitor's incident state
    CheckResult {
        result: CheckResult,
        phase: IncidentPhase,
        consecutive_failures: usize,
    },

    /// The failure threshold was crossed
    IncidentOpened {
        incident: Incident,
        /// Timestamp of the result that crossed the threshold
        at: DateTime<Utc>,
    },

    /// The open incident was closed
    IncidentResolved {
        incident: Incident,
        /// Closed by an operator instead of a successful probe
        manual: bool,
    },

    /// Derived statistics of the monitor are out of date
    StatsInvalidated {
        monitor_id: MonitorId,
        at: DateTime<Utc>,
    },
}

impl MonitorEvent {
    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::CheckResult { .. } => "check_result",
            MonitorEvent::IncidentOpened { .. } => "incident_opened",
            MonitorEvent::IncidentResolved { .. } => "incident_resolved",
            MonitorEvent::StatsInvalidated { .. } => "stats_invalidated",
        }
    }

    pub fn monitor_id(&self) -> MonitorId {
        match self {
            MonitorEvent::CheckResult { result, .. } => result.monitor_id,
            MonitorEvent::IncidentOpened { incident, .. }
            | MonitorEvent::IncidentResolved { incident, .. } => incident.monitor_id,
            MonitorEvent::StatsInvalidated { monitor_id, .. } => *monitor_id,
        }
    }

    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MonitorEvent::CheckResult { result, .. } => result.timestamp,
            MonitorEvent::IncidentOpened { at, .. } => *at,
            MonitorEvent::IncidentResolved { incident, .. } => {
                incident.resolved_at.unwrap_or_else(Utc::now)
            }
            MonitorEvent::StatsInvalidated { at, .. } => *at,
        }
    }

    /// Observer wire representation
    pub fn to_live_message(&self) -> LiveMessage {
        let payload = match self {
            MonitorEvent::CheckResult {
                result,
                phase,
                consecutive_failures,
            } => json!({
                "check_id": result.check_id,
                "success": result.success,
                "status_code": result.status_code,
                "latency_ms": result.latency_ms,
                "error": result.error,
                "error_message": result.error_message,
                "phase": phase,
                "consecutive_failures": consecutive_failures,
            }),
            MonitorEvent::IncidentOpened { incident, .. } => json!({
                "incident_id": incident.id,
                "opened_at": incident.opened_at,
                "cause": incident.cause,
            }),
            MonitorEvent::IncidentResolved { incident, manual } => json!({
                "incident_id": incident.id,
                "opened_at": incident.opened_at,
                "resolved_at": incident.resolved_at,
                "duration_secs": incident.duration_secs(),
                "cause": incident.cause,
                "manual": manual,
            }),
            MonitorEvent::StatsInvalidated { .. } => json!({}),
        };

        LiveMessage {
            kind: self.kind().to_string(),
            monitor_id: Some(self.monitor_id()),
            payload,
            timestamp: self.timestamp(),
        }
    }
}

/// Message pushed to observers
///
/// Serializes as `{"type", "monitor_id", "payload", "timestamp"}` with an
/// RFC 3339 timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessage {
    #[serde(rename = "type")]
    pub kind: String,

    /// Absent for connection-level messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<MonitorId>,

    #[serde(default)]
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl LiveMessage {
    /// Greeting sent right after an observer connects
    pub fn connected() -> Self {
        Self {
            kind: "connected".to_string(),
            monitor_id: None,
            payload: json!({ "message": "WebSocket connected successfully" }),
            timestamp: Utc::now(),
        }
    }

    /// Answer to an application-level `ping`
    pub fn pong() -> Self {
        Self {
            kind: "pong".to_string(),
            monitor_id: None,
            payload: json!({}),
            timestamp: Utc::now(),
        }
    }
}

/// Scheduling state of one monitor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Waiting for the next tick
    Idle,
    /// A probe is in flight
    Probing,
    /// The monitor's task panicked, its schedule is halted
    Faulted,
}

/// Snapshot of one scheduled monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMonitor {
    pub config: MonitorConfig,
    pub state: SlotState,
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Ticks skipped because the previous probe was still running
    pub skipped_ticks: u64,
}

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Apply a single registry change immediately
    Apply(RegistryChange),

    /// Refresh the full registry snapshot now
    RefreshNow {
        respond_to: oneshot::Sender<anyhow::Result<usize>>,
    },

    /// Get the scheduling state of every monitor
    GetStatus {
        respond_to: oneshot::Sender<Vec<ScheduledMonitor>>,
    },

    /// Cancel all timers and in-flight probes, then stop
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Incident state of one monitor as seen by the detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorState {
    pub monitor_id: MonitorId,
    pub phase: IncidentPhase,
    pub consecutive_failures: usize,
    pub open_incident: Option<Incident>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Commands that can be sent to the DetectorActor
#[derive(Debug)]
pub enum DetectorCommand {
    /// Get the incident state of one monitor
    GetState {
        monitor_id: MonitorId,
        respond_to: oneshot::Sender<Option<MonitorState>>,
    },

    /// Get the incident state of every tracked monitor
    GetAll {
        respond_to: oneshot::Sender<Vec<MonitorState>>,
    },

    /// Close the open incident without a successful probe
    ResolveManually {
        monitor_id: MonitorId,
        respond_to: oneshot::Sender<Option<Incident>>,
    },

    /// Drop the tracker of a deleted monitor
    Forget { monitor_id: MonitorId },

    /// Gracefully shut down the detector
    Shutdown,
}

/// Commands that can be sent to the BroadcasterActor
#[derive(Debug)]
pub enum BroadcasterCommand {
    /// Register a new observer connection
    Connect {
        respond_to: oneshot::Sender<(u64, mpsc::Receiver<LiveMessage>)>,
    },

    /// Remove an observer connection
    Disconnect { connection_id: u64 },

    /// Number of currently registered connections
    ConnectionCount { respond_to: oneshot::Sender<usize> },

    /// Gracefully shut down the broadcaster
    Shutdown,
}

/// Commands that can be sent to the StorageActor
#[derive(Debug)]
pub enum StorageCommand {
    /// Manually flush write buffer to storage
    Flush {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// Get storage statistics
    GetStats {
        respond_to: oneshot::Sender<StorageStats>,
    },

    /// Gracefully shut down the storage actor
    Shutdown,
}

/// Storage statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    /// Check results written to the backend
    pub checks_written: u64,

    /// Number of results in write buffer
    pub buffer_size: usize,

    /// Number of flush operations performed
    pub flush_count: u64,

    /// Writes given up after all retries
    pub failed_writes: u64,

    /// Last retention cleanup
    pub last_cleanup_time: Option<DateTime<Utc>>,

    pub total_checks_deleted: u64,
}
