//! Per-monitor incident state machine
//!
//! ```text
//!              failure (n < T)            failure (n == T)
//!   Healthy ───────────────────▶ Degrading ───────────────▶ IncidentOpen
//!      ▲                            │                           │
//!      └────────── success ─────────┴───────── success ─────────┘
//!                                                 (resolves incident)
//! ```
//!
//! `n` is the consecutive-failure counter, `T` the deployment-wide threshold.
//! The tracker is a plain value without any I/O so it can be driven by the
//! detector actor and by tests alike.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::monitor::{CheckError, CheckResult, Incident, MonitorId};

/// Default number of consecutive failures that opens an incident
pub const DEFAULT_FAILURE_THRESHOLD: usize = 3;

/// Health phase of a single monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentPhase {
    /// Last probe succeeded (or nothing was probed yet)
    Healthy,
    /// Failing, but below the threshold
    Degrading,
    /// Threshold crossed, incident open until the next success
    IncidentOpen,
}

impl std::fmt::Display for IncidentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentPhase::Healthy => write!(f, "healthy"),
            IncidentPhase::Degrading => write!(f, "degrading"),
            IncidentPhase::IncidentOpen => write!(f, "incident_open"),
        }
    }
}

/// What applying one result changed
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub previous: IncidentPhase,
    pub phase: IncidentPhase,
    pub consecutive_failures: usize,
    /// Set when this result crossed the threshold
    pub opened: Option<Incident>,
    /// Set when this result closed the open incident
    pub resolved: Option<Incident>,
}

/// Result of feeding a check result into the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied(Evaluation),
    /// Same `check_id` as the last applied result
    Duplicate,
    /// Older than the last applied result
    Stale,
}

/// Incident state of one monitor
#[derive(Debug, Clone)]
pub struct IncidentTracker {
    monitor_id: MonitorId,
    threshold: usize,
    consecutive_failures: usize,
    /// Timestamp and cause of the first failure of the current streak
    streak_start: Option<(DateTime<Utc>, CheckError)>,
    open_incident: Option<Incident>,
    last_check: Option<(Uuid, DateTime<Utc>)>,
}

impl IncidentTracker {
    pub fn new(monitor_id: MonitorId, threshold: usize) -> Self {
        Self {
            monitor_id,
            threshold: threshold.max(1),
            consecutive_failures: 0,
            streak_start: None,
            open_incident: None,
            last_check: None,
        }
    }

    /// Resume tracking an incident that is still open in storage
    pub fn with_open_incident(mut self, incident: Incident) -> Self {
        self.consecutive_failures = self.threshold;
        self.streak_start = Some((incident.opened_at, incident.cause));
        self.open_incident = Some(incident);
        self
    }

    pub fn monitor_id(&self) -> MonitorId {
        self.monitor_id
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn open_incident(&self) -> Option<&Incident> {
        self.open_incident.as_ref()
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.last_check.map(|(_, at)| at)
    }

    pub fn phase(&self) -> IncidentPhase {
        if self.open_incident.is_some() {
            IncidentPhase::IncidentOpen
        } else if self.consecutive_failures > 0 {
            IncidentPhase::Degrading
        } else {
            IncidentPhase::Healthy
        }
    }

    /// Apply one check result in arrival order
    pub fn apply(&mut self, result: &CheckResult) -> Outcome {
        if let Some((last_id, last_at)) = self.last_check {
            if last_id == result.check_id {
                return Outcome::Duplicate;
            }
            if result.timestamp < last_at {
                return Outcome::Stale;
            }
        }
        self.last_check = Some((result.check_id, result.timestamp));

        let previous = self.phase();
        let mut opened = None;
        let mut resolved = None;

        if result.success {
            self.consecutive_failures = 0;
            self.streak_start = None;

            if let Some(mut incident) = self.open_incident.take() {
                incident.resolved_at = Some(result.timestamp);
                resolved = Some(incident);
            }
        } else {
            self.consecutive_failures += 1;

            let cause = result.error.unwrap_or(CheckError::RequestError);
            let (started_at, first_cause) = *self
                .streak_start
                .get_or_insert((result.timestamp, cause));

            if self.consecutive_failures == self.threshold && self.open_incident.is_none() {
                let incident = Incident {
                    id: Uuid::new_v4(),
                    monitor_id: self.monitor_id,
                    opened_at: started_at,
                    resolved_at: None,
                    cause: first_cause,
                };
                self.open_incident = Some(incident.clone());
                opened = Some(incident);
            }
        }

        Outcome::Applied(Evaluation {
            previous,
            phase: self.phase(),
            consecutive_failures: self.consecutive_failures,
            opened,
            resolved,
        })
    }

    /// Close the open incident without a successful probe
    ///
    /// Resets the failure streak, so a still failing monitor needs another
    /// full streak before a new incident is opened.
    pub fn resolve_manually(&mut self, at: DateTime<Utc>) -> Option<Incident> {
        let mut incident = self.open_incident.take()?;
        incident.resolved_at = Some(at);
        self.consecutive_failures = 0;
        self.streak_start = None;
        Some(incident)
    }
}
