//! Aggregate types computed from persisted check results
//!
//! Check results and incidents are persisted as-is (see `monitor.rs`); this
//! module holds the derived values the query side works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::{CheckResult, MonitorId};

/// Uptime statistics for one monitor within a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeStats {
    pub monitor_id: MonitorId,

    /// Start of the window (inclusive)
    pub since: DateTime<Utc>,

    pub total_checks: u64,

    pub successful_checks: u64,

    pub failed_checks: u64,

    /// successful / total × 100, rounded to two decimals. 100 when nothing was checked.
    pub uptime_percentage: f64,

    /// Mean latency of successful checks
    pub avg_response_time_ms: Option<f64>,

    pub last_check_at: Option<DateTime<Utc>>,

    pub last_check_success: Option<bool>,

    /// Incidents opened within the window
    pub total_incidents: u64,

    /// Incidents currently open
    pub ongoing_incidents: u64,
}

impl UptimeStats {
    /// Fold check results (any order) into statistics
    ///
    /// Incident counts are left at zero; backends fill them in.
    pub fn from_checks<'a>(
        monitor_id: MonitorId,
        since: DateTime<Utc>,
        checks: impl IntoIterator<Item = &'a CheckResult>,
    ) -> Self {
        let mut total = 0u64;
        let mut successful = 0u64;
        let mut latency_sum = 0u64;
        let mut latency_count = 0u64;
        let mut last: Option<&CheckResult> = None;

        for check in checks {
            total += 1;
            if check.success {
                successful += 1;
                if let Some(latency) = check.latency_ms {
                    latency_sum += latency;
                    latency_count += 1;
                }
            }
            if last.is_none_or(|l| check.timestamp >= l.timestamp) {
                last = Some(check);
            }
        }

        Self {
            monitor_id,
            since,
            total_checks: total,
            successful_checks: successful,
            failed_checks: total - successful,
            uptime_percentage: uptime_percentage(successful, total),
            avg_response_time_ms: (latency_count > 0)
                .then(|| round2(latency_sum as f64 / latency_count as f64)),
            last_check_at: last.map(|c| c.timestamp),
            last_check_success: last.map(|c| c.success),
            total_incidents: 0,
            ongoing_incidents: 0,
        }
    }
}

/// Uptime in percent, 100 when there is no data yet
pub fn uptime_percentage(successful: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    round2(successful as f64 / total as f64 * 100.0)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
