//! HTTP endpoint uptime checker
//!
//! Probes configured monitors on their own schedules, turns sustained
//! failures into incidents and pushes every transition to live observers.

pub mod actors;
pub mod config;
pub mod incident;
pub mod monitor;
pub mod registry;
pub mod stats;
pub mod storage;

#[cfg(feature = "api")]
pub mod api;

pub use incident::{IncidentPhase, IncidentTracker};
pub use monitor::{CheckError, CheckResult, HttpMethod, Incident, MonitorConfig, MonitorId};
pub use registry::{InMemoryRegistry, MonitorRegistry, RegistryChange, RegistryError};
