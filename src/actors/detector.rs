//! DetectorActor - applies probe results to per-monitor incident state
//!
//! ## Message Flow
//!
//! ```text
//! monitor tasks ──(ordered mpsc)──▶ DetectorActor ──▶ broadcast<MonitorEvent>
//!                                        ▲                 ├─▶ StorageActor
//!                                        │                 ├─▶ BroadcasterActor
//!      Commands (GetState, ResolveManually, Forget)        └─▶ StatsCache
//! ```
//!
//! The actor is the single writer of every `IncidentTracker`, so results of
//! one monitor are applied strictly in arrival order.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument, trace, warn};

use super::messages::{DetectorCommand, MonitorEvent, MonitorState};
use crate::incident::{IncidentTracker, Outcome};
use crate::monitor::{CheckResult, Incident, MonitorId};

/// Capacity of the result channel shared by all monitor tasks
const RESULT_CHANNEL_CAPACITY: usize = 1024;

pub struct DetectorActor {
    trackers: HashMap<MonitorId, IncidentTracker>,

    /// Consecutive failures that open an incident
    threshold: usize,

    result_rx: mpsc::Receiver<CheckResult>,

    command_rx: mpsc::Receiver<DetectorCommand>,

    event_tx: broadcast::Sender<MonitorEvent>,
}

impl DetectorActor {
    pub fn new(
        threshold: usize,
        restored: Vec<Incident>,
        result_rx: mpsc::Receiver<CheckResult>,
        command_rx: mpsc::Receiver<DetectorCommand>,
        event_tx: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        let mut trackers = HashMap::new();
        for incident in restored {
            debug!(
                "restoring open incident {} of monitor {}",
                incident.id, incident.monitor_id
            );
            trackers.insert(
                incident.monitor_id,
                IncidentTracker::new(incident.monitor_id, threshold).with_open_incident(incident),
            );
        }

        Self {
            trackers,
            threshold,
            result_rx,
            command_rx,
            event_tx,
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self), fields(threshold = self.threshold))]
    pub async fn run(mut self) {
        debug!("starting incident detector");

        loop {
            tokio::select! {
                // drain queued results before answering queries about them
                biased;

                Some(result) = self.result_rx.recv() => {
                    self.apply(result);
                }

                Some(cmd) = self.command_rx.recv() => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                }

                else => {
                    warn!("detector channels closed, shutting down");
                    break;
                }
            }
        }

        debug!("incident detector stopped");
    }

    fn apply(&mut self, result: CheckResult) {
        let monitor_id = result.monitor_id;
        let threshold = self.threshold;
        let tracker = self
            .trackers
            .entry(monitor_id)
            .or_insert_with(|| IncidentTracker::new(monitor_id, threshold));

        let evaluation = match tracker.apply(&result) {
            Outcome::Applied(evaluation) => evaluation,
            Outcome::Duplicate => {
                debug!("ignoring replayed result {} of monitor {monitor_id}", result.check_id);
                return;
            }
            Outcome::Stale => {
                debug!("ignoring out-of-order result {} of monitor {monitor_id}", result.check_id);
                return;
            }
        };

        if evaluation.previous != evaluation.phase {
            debug!(
                "monitor {monitor_id}: {} -> {}",
                evaluation.previous, evaluation.phase
            );
        }

        let at = result.timestamp;
        self.publish(MonitorEvent::CheckResult {
            result,
            phase: evaluation.phase,
            consecutive_failures: evaluation.consecutive_failures,
        });

        if let Some(incident) = evaluation.opened {
            info!(
                "monitor {monitor_id}: incident {} opened ({} consecutive failures, cause {})",
                incident.id, evaluation.consecutive_failures, incident.cause
            );
            self.publish(MonitorEvent::IncidentOpened { incident, at });
        }

        if let Some(incident) = evaluation.resolved {
            info!(
                "monitor {monitor_id}: incident {} resolved after {}s",
                incident.id,
                incident.duration_secs().unwrap_or_default()
            );
            self.publish(MonitorEvent::IncidentResolved {
                incident,
                manual: false,
            });
        }

        self.publish(MonitorEvent::StatsInvalidated { monitor_id, at });
    }

    /// Returns `false` when the actor should stop
    fn handle_command(&mut self, cmd: DetectorCommand) -> bool {
        match cmd {
            DetectorCommand::GetState {
                monitor_id,
                respond_to,
            } => {
                let state = self.trackers.get(&monitor_id).map(state_of);
                let _ = respond_to.send(state);
            }

            DetectorCommand::GetAll { respond_to } => {
                let mut states: Vec<MonitorState> = self.trackers.values().map(state_of).collect();
                states.sort_by_key(|s| s.monitor_id);
                let _ = respond_to.send(states);
            }

            DetectorCommand::ResolveManually {
                monitor_id,
                respond_to,
            } => {
                let now = Utc::now();
                let resolved = self
                    .trackers
                    .get_mut(&monitor_id)
                    .and_then(|tracker| tracker.resolve_manually(now));

                if let Some(incident) = &resolved {
                    info!("monitor {monitor_id}: incident {} resolved manually", incident.id);
                    self.publish(MonitorEvent::IncidentResolved {
                        incident: incident.clone(),
                        manual: true,
                    });
                    self.publish(MonitorEvent::StatsInvalidated { monitor_id, at: now });
                }

                let _ = respond_to.send(resolved);
            }

            DetectorCommand::Forget { monitor_id } => {
                if let Some(tracker) = self.trackers.remove(&monitor_id) {
                    match tracker.open_incident() {
                        Some(incident) => debug!(
                            "forgetting monitor {monitor_id}, incident {} stays open",
                            incident.id
                        ),
                        None => debug!("forgetting monitor {monitor_id}"),
                    }
                }
            }

            DetectorCommand::Shutdown => {
                debug!("received shutdown command");
                return false;
            }
        }

        true
    }

    fn publish(&self, event: MonitorEvent) {
        trace!("publishing {} for monitor {}", event.kind(), event.monitor_id());
        if self.event_tx.send(event).is_err() {
            trace!("no event subscribers");
        }
    }
}

fn state_of(tracker: &IncidentTracker) -> MonitorState {
    MonitorState {
        monitor_id: tracker.monitor_id(),
        phase: tracker.phase(),
        consecutive_failures: tracker.consecutive_failures(),
        open_incident: tracker.open_incident().cloned(),
        last_checked_at: tracker.last_checked_at(),
    }
}

/// Handle for controlling the DetectorActor
#[derive(Clone)]
pub struct DetectorHandle {
    sender: mpsc::Sender<DetectorCommand>,
    results: mpsc::Sender<CheckResult>,
}

impl DetectorHandle {
    /// Spawn a detector, resuming the given open incidents
    pub fn spawn(
        threshold: usize,
        restored: Vec<Incident>,
        event_tx: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

        let actor = DetectorActor::new(threshold, restored, result_rx, cmd_rx, event_tx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            results: result_tx,
        }
    }

    /// Sender feeding the ordered result channel
    pub fn result_sender(&self) -> mpsc::Sender<CheckResult> {
        self.results.clone()
    }

    /// Feed a single result (replays, tests)
    pub async fn submit(&self, result: CheckResult) -> Result<()> {
        self.results.send(result).await?;
        Ok(())
    }

    /// Incident state of one monitor, `None` if it was never checked
    pub async fn state(&self, monitor_id: MonitorId) -> Result<Option<MonitorState>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DetectorCommand::GetState {
                monitor_id,
                respond_to: tx,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Incident state of every tracked monitor, ordered by id
    pub async fn all_states(&self) -> Result<Vec<MonitorState>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DetectorCommand::GetAll { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    /// Operator override: close the monitor's open incident now
    pub async fn resolve_manually(&self, monitor_id: MonitorId) -> Result<Option<Incident>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DetectorCommand::ResolveManually {
                monitor_id,
                respond_to: tx,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Drop the state of a deleted monitor
    pub async fn forget(&self, monitor_id: MonitorId) -> Result<()> {
        self.sender
            .send(DetectorCommand::Forget { monitor_id })
            .await?;
        Ok(())
    }

    /// Shut down the detector
    pub async fn shutdown(self) {
        let _ = self.sender.send(DetectorCommand::Shutdown).await;
    }
}
