//! Monitor configuration and check result types
//!
//! These are the values flowing through the checker core:
//!
//! ```text
//! MonitorConfig → Prober → CheckResult → IncidentTracker → Incident
//! ```
//!
//! `MonitorConfig` is owned by the persistence collaborator, the core only
//! ever holds snapshots of it. `CheckResult` and `Incident` are produced by the
//! core and handed to storage and observers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a monitor (primary key of the monitors table)
pub type MonitorId = i64;

/// Allowed range for `check_interval` in seconds
pub const CHECK_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 10..=3600;

/// Allowed range for `timeout` in seconds
pub const TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=60;

/// Allowed range for `expected_status`
pub const EXPECTED_STATUS_RANGE: std::ops::RangeInclusive<u16> = 100..=599;

/// HTTP methods a monitor can probe with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unsupported HTTP method: {other}")),
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Snapshot of a monitor's configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub id: MonitorId,

    /// Owning user (only carried through, never interpreted by the core)
    #[serde(default)]
    pub owner_id: i64,

    /// Display name
    #[serde(default)]
    pub name: String,

    pub url: String,

    #[serde(default)]
    pub method: HttpMethod,

    /// Extra request headers sent with every probe
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Seconds between two probes
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Probe timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_active", alias = "active")]
    pub is_active: bool,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_expected_status() -> u16 {
    200
}

fn default_check_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    10
}

fn default_active() -> bool {
    true
}

impl MonitorConfig {
    /// Create a config with the default probe settings (GET, 200, 60s, 10s)
    pub fn new(id: MonitorId, url: impl Into<String>) -> Self {
        Self {
            id,
            owner_id: 0,
            name: format!("monitor-{id}"),
            url: url.into(),
            method: HttpMethod::default(),
            headers: HashMap::new(),
            expected_status: default_expected_status(),
            check_interval: default_check_interval(),
            timeout: default_timeout(),
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    /// Check the configured values against the allowed ranges
    pub fn validate(&self) -> Result<(), String> {
        if !CHECK_INTERVAL_RANGE.contains(&self.check_interval) {
            return Err(format!(
                "monitor {}: check_interval {}s outside of {}..={}",
                self.id,
                self.check_interval,
                CHECK_INTERVAL_RANGE.start(),
                CHECK_INTERVAL_RANGE.end()
            ));
        }

        if !TIMEOUT_RANGE.contains(&self.timeout) {
            return Err(format!(
                "monitor {}: timeout {}s outside of {}..={}",
                self.id,
                self.timeout,
                TIMEOUT_RANGE.start(),
                TIMEOUT_RANGE.end()
            ));
        }

        if !EXPECTED_STATUS_RANGE.contains(&self.expected_status) {
            return Err(format!(
                "monitor {}: expected_status {} is not a valid HTTP status",
                self.id, self.expected_status
            ));
        }

        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(format!(
                "monitor {}: url '{}' must start with http:// or https://",
                self.id, self.url
            ));
        }

        Ok(())
    }

    /// Whether two snapshots differ in anything that affects probing
    ///
    /// `name`, `owner_id` and `updated_at` do not require a reschedule.
    pub fn probe_settings_differ(&self, other: &MonitorConfig) -> bool {
        self.url != other.url
            || self.method != other.method
            || self.headers != other.headers
            || self.expected_status != other.expected_status
            || self.check_interval != other.check_interval
            || self.timeout != other.timeout
            || self.is_active != other.is_active
    }
}

/// Classification of a failed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckError {
    /// No response within the monitor's timeout
    Timeout,
    /// TCP connection could not be established
    ConnectionRefused,
    /// Host name could not be resolved
    DnsFailure,
    /// A response arrived but its status was not the expected one
    UnexpectedStatus,
    /// Any other transport failure (TLS, invalid URL, redirect loop, ...)
    RequestError,
}

impl CheckError {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckError::Timeout => "timeout",
            CheckError::ConnectionRefused => "connection-refused",
            CheckError::DnsFailure => "dns-failure",
            CheckError::UnexpectedStatus => "unexpected-status",
            CheckError::RequestError => "request-error",
        }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(CheckError::Timeout),
            "connection-refused" => Ok(CheckError::ConnectionRefused),
            "dns-failure" => Ok(CheckError::DnsFailure),
            "unexpected-status" => Ok(CheckError::UnexpectedStatus),
            "request-error" => Ok(CheckError::RequestError),
            other => Err(format!("unknown check error: {other}")),
        }
    }
}

/// Outcome of a single probe
///
/// Immutable once created. `error` is `None` exactly when `success` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Unique id of this result, used to make replays idempotent
    pub check_id: Uuid,

    pub monitor_id: MonitorId,

    pub timestamp: DateTime<Utc>,

    pub success: bool,

    /// Observed HTTP status, `None` when no response arrived
    pub status_code: Option<u16>,

    /// Milliseconds from dispatch until response headers arrived
    pub latency_ms: Option<u64>,

    pub error: Option<CheckError>,

    /// Human readable failure description
    pub error_message: Option<String>,
}

impl CheckResult {
    /// A successful probe
    pub fn up(monitor_id: MonitorId, status_code: u16, latency_ms: u64) -> Self {
        Self {
            check_id: Uuid::new_v4(),
            monitor_id,
            timestamp: Utc::now(),
            success: true,
            status_code: Some(status_code),
            latency_ms: Some(latency_ms),
            error: None,
            error_message: None,
        }
    }

    /// A failed probe
    pub fn down(monitor_id: MonitorId, error: CheckError, message: impl Into<String>) -> Self {
        Self {
            check_id: Uuid::new_v4(),
            monitor_id,
            timestamp: Utc::now(),
            success: false,
            status_code: None,
            latency_ms: None,
            error: Some(error),
            error_message: Some(message.into()),
        }
    }

    /// A response that arrived with the wrong status code
    pub fn unexpected_status(
        monitor_id: MonitorId,
        expected: u16,
        status_code: u16,
        latency_ms: u64,
    ) -> Self {
        Self {
            status_code: Some(status_code),
            latency_ms: Some(latency_ms),
            ..Self::down(
                monitor_id,
                CheckError::UnexpectedStatus,
                format!("Expected status {expected}, got {status_code}"),
            )
        }
    }

    /// Override the timestamp (used by replays and tests)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A tracked interval of sustained failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,

    pub monitor_id: MonitorId,

    /// Timestamp of the first failing result of the streak
    pub opened_at: DateTime<Utc>,

    pub resolved_at: Option<DateTime<Utc>>,

    /// Classification of the first failing result of the streak
    pub cause: CheckError,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Downtime in seconds, available once resolved
    pub fn duration_secs(&self) -> Option<i64> {
        self.resolved_at
            .map(|resolved| (resolved - self.opened_at).num_seconds())
    }
}
