//! Actor-based checker core
//!
//! Each actor runs as an independent async task communicating via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!      MonitorRegistry (refresh + change notifications)
//!               │
//!      ┌────────▼────────┐
//!      │ SchedulerActor  │── one task per monitor ──▶ Probe (HttpProber)
//!      └────────┬────────┘
//!               │ ordered mpsc<CheckResult>
//!      ┌────────▼────────┐
//!      │  DetectorActor  │ incident state per monitor
//!      └────────┬────────┘
//!               │ broadcast<MonitorEvent>
//!      ┌────────┼──────────────────┬───────────────────┐
//!      │        │                  │                   │
//! ┌────▼─────────────┐  ┌──────────▼───────┐  ┌────────▼───────┐
//! │  StorageActor    │  │ BroadcasterActor │  │   StatsCache   │
//! │ (persistence)    │  │ (live observers) │  │ (invalidation) │
//! └──────────────────┘  └──────────────────┘  └────────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **SchedulerActor**: Owns the per-monitor probe loops and the global probe pool
//! - **DetectorActor**: Turns check results into incident transitions
//! - **BroadcasterActor**: Pushes events to connected observers
//! - **StorageActor**: Persists check results and incidents
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: The detector publishes events to a broadcast channel for fan-out
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod broadcaster;
pub mod detector;
pub mod messages;
pub mod prober;
pub mod scheduler;
pub mod storage;
