//! SchedulerActor - owns one probe loop per active monitor
//!
//! ## Architecture
//!
//! ```text
//!   MonitorRegistry ──refresh──┐
//!   RegistryChange ────────────┤
//!   SchedulerCommand ──────────┤
//!                              ▼
//!                       SchedulerActor ── spawns/cancels ──▶ monitor task (one per monitor)
//!                                                              │ tick → permit → probe
//!                                                              ▼
//!                                                   ordered mpsc → DetectorActor
//! ```
//!
//! ## Guarantees
//!
//! - **No overlap**: a monitor task awaits its own probe before it looks at the
//!   next tick, ticks that pass meanwhile are skipped (`MissedTickBehavior::Skip`).
//!   Every generation of a monitor's task shares one per-monitor gate that
//!   outlives the slot until the last task is reaped, so an edit, a
//!   deactivate/reactivate or a delete/re-create waits for the old in-flight probe.
//! - **Bounded fan-out**: every probe holds a permit of one global semaphore.
//! - **Immediate first probe**: a newly scheduled monitor is probed right away.
//! - **Cancellation**: removing or deactivating a monitor cancels its timer at
//!   once; a probe already in flight completes and its result is discarded.
//!   Shutdown aborts in-flight probes as well.
//! - **Fault isolation**: a panic inside a monitor task halts that monitor only;
//!   it is logged and reported as `Faulted` in the status. Only an edit of the
//!   monitor restarts it.
//! - **Registry outages**: a failed refresh keeps the previous snapshot.
//! - **Deletions without a change stream**: a monitor that vanished from the
//!   registry entirely is forgotten by the detector, a deactivated one is not.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use super::detector::DetectorHandle;
use super::messages::{ScheduledMonitor, SchedulerCommand, SlotState};
use super::prober::Probe;
use crate::config::CheckerConfig;
use crate::monitor::{CheckResult, MonitorConfig, MonitorId};
use crate::registry::{MonitorRegistry, RegistryChange};

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Global cap on probes in flight
    pub max_concurrent_probes: usize,

    /// Full registry refresh cadence
    pub registry_refresh: Duration,
}

impl From<&CheckerConfig> for SchedulerSettings {
    fn from(config: &CheckerConfig) -> Self {
        Self {
            max_concurrent_probes: config.max_concurrent_probes,
            registry_refresh: Duration::from_secs(config.registry_refresh_secs),
        }
    }
}

/// Mutable state shared between a monitor task and the scheduler
#[derive(Debug)]
struct SlotInfo {
    state: SlotState,
    last_probe_at: Option<DateTime<Utc>>,
    skipped_ticks: u64,
}

type SharedSlotInfo = Arc<Mutex<SlotInfo>>;

/// Held for the duration of a probe
type Gate = Arc<tokio::sync::Mutex<()>>;

fn update(info: &SharedSlotInfo, f: impl FnOnce(&mut SlotInfo)) {
    let mut guard = info.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

/// One scheduled monitor
struct Slot {
    config: MonitorConfig,
    cancel: CancellationToken,
    task_id: task::Id,
    info: SharedSlotInfo,
}

/// Everything a monitor task needs
#[derive(Clone)]
struct ProbeContext {
    prober: Arc<dyn Probe>,
    permits: Arc<Semaphore>,
    results: mpsc::Sender<CheckResult>,
    shutdown: CancellationToken,
}

pub struct SchedulerActor {
    registry: Arc<dyn MonitorRegistry>,

    /// Push notifications, `None` once the sender side is gone
    changes: Option<broadcast::Receiver<RegistryChange>>,

    detector: DetectorHandle,

    context: ProbeContext,

    settings: SchedulerSettings,

    command_rx: mpsc::Receiver<SchedulerCommand>,

    slots: HashMap<MonitorId, Slot>,

    /// Monitor tasks, keyed back to their monitor through `task_owners`
    tasks: JoinSet<()>,

    /// Every live task, including replaced and unscheduled ones
    task_owners: HashMap<task::Id, MonitorId>,

    /// Per-monitor gates, kept while a slot or a live task refers to them
    gates: HashMap<MonitorId, Gate>,
}

impl SchedulerActor {
    pub fn new(
        settings: SchedulerSettings,
        registry: Arc<dyn MonitorRegistry>,
        changes: Option<broadcast::Receiver<RegistryChange>>,
        prober: Arc<dyn Probe>,
        detector: DetectorHandle,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let context = ProbeContext {
            prober,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_probes.max(1))),
            results: detector.result_sender(),
            shutdown,
        };

        Self {
            registry,
            changes,
            detector,
            context,
            settings,
            command_rx,
            slots: HashMap::new(),
            tasks: JoinSet::new(),
            task_owners: HashMap::new(),
            gates: HashMap::new(),
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self), fields(max_concurrent = self.settings.max_concurrent_probes))]
    pub async fn run(mut self) {
        debug!("starting scheduler");

        // first tick fires immediately: initial load
        let mut refresh = time::interval(self.settings.registry_refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = self.context.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("shutdown requested");
                    break;
                }

                _ = refresh.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("registry refresh failed, keeping previous snapshot: {e:#}");
                    }
                }

                change = next_change(&mut self.changes), if self.changes.is_some() => {
                    match change {
                        Ok(change) => self.apply(change).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("missed {skipped} registry changes, refreshing");
                            if let Err(e) = self.refresh().await {
                                warn!("registry refresh failed, keeping previous snapshot: {e:#}");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("registry change stream closed, relying on refresh");
                            self.changes = None;
                        }
                    }
                }

                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.reap(joined);
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::Apply(change) => self.apply(change).await,

                        SchedulerCommand::RefreshNow { respond_to } => {
                            let _ = respond_to.send(self.refresh().await);
                        }

                        SchedulerCommand::GetStatus { respond_to } => {
                            let _ = respond_to.send(self.status());
                        }

                        SchedulerCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            self.stop().await;
                            let _ = respond_to.send(());
                            return;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        self.stop().await;
    }

    /// Cancel every timer and in-flight probe and wait for the tasks
    async fn stop(&mut self) {
        self.context.shutdown.cancel();
        self.tasks.shutdown().await;
        self.slots.clear();
        self.task_owners.clear();
        self.gates.clear();
        info!("scheduler stopped");
    }

    /// Reconcile the slots with a full registry snapshot
    #[instrument(skip(self))]
    async fn refresh(&mut self) -> Result<usize> {
        let monitors = self
            .registry
            .list_active_monitors()
            .await
            .context("failed to list active monitors")?;

        let mut desired: HashMap<MonitorId, MonitorConfig> = HashMap::new();
        for config in monitors {
            if let Err(e) = config.validate() {
                warn!("skipping invalid monitor: {e}");
                continue;
            }
            desired.insert(config.id, config);
        }

        let stale: Vec<MonitorId> = self
            .slots
            .keys()
            .filter(|id| !desired.contains_key(id))
            .copied()
            .collect();
        if !stale.is_empty() {
            self.unschedule_stale(stale).await;
        }

        for config in desired.into_values() {
            self.schedule(config);
        }

        trace!("{} monitors scheduled", self.slots.len());
        Ok(self.slots.len())
    }

    /// Unschedule monitors missing from the active snapshot, forgetting the
    /// incident state of those that were deleted rather than deactivated
    async fn unschedule_stale(&mut self, stale: Vec<MonitorId>) {
        let known: Option<HashSet<MonitorId>> = match self.registry.list_monitors().await {
            Ok(monitors) => Some(monitors.iter().map(|m| m.id).collect()),
            Err(e) => {
                warn!("failed to list monitors, treating missing ones as inactive: {e}");
                None
            }
        };

        for id in stale {
            let deleted = known.as_ref().is_some_and(|known| !known.contains(&id));
            if deleted {
                self.unschedule(id, "deleted");
                if let Err(e) = self.detector.forget(id).await {
                    warn!("failed to drop incident state of monitor {id}: {e:#}");
                }
            } else {
                self.unschedule(id, "no longer active");
            }
        }
    }

    async fn apply(&mut self, change: RegistryChange) {
        match change {
            RegistryChange::Upserted(config) if config.is_active => match config.validate() {
                Ok(()) => self.schedule(config),
                Err(e) => {
                    warn!("rejecting monitor update: {e}");
                    self.unschedule(config.id, "invalid configuration");
                }
            },
            RegistryChange::Upserted(config) => {
                // open incidents stay open while the monitor is inactive
                self.unschedule(config.id, "deactivated");
            }
            RegistryChange::Removed(id) => {
                self.unschedule(id, "deleted");
                if let Err(e) = self.detector.forget(id).await {
                    warn!("failed to drop incident state of monitor {id}: {e:#}");
                }
            }
        }
    }

    /// Start, restart or keep the probe loop of a monitor
    fn schedule(&mut self, config: MonitorConfig) {
        match self.slots.get_mut(&config.id) {
            Some(slot) => {
                let changed = slot.config.probe_settings_differ(&config);
                // a halted loop only restarts once the monitor was edited
                let edited = slot_state(&slot.info) == SlotState::Faulted
                    && slot.config.updated_at != config.updated_at;
                if !changed && !edited {
                    slot.config = config;
                    return;
                }
                debug!("monitor {} changed, rescheduling", config.id);
                slot.cancel.cancel();
            }
            None => {
                info!(
                    "scheduling monitor {} ({}) every {}s",
                    config.id, config.url, config.check_interval
                );
            }
        }

        let gate = self
            .gates
            .entry(config.id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let cancel = self.context.shutdown.child_token();
        let info = Arc::new(Mutex::new(SlotInfo {
            state: SlotState::Idle,
            last_probe_at: None,
            skipped_ticks: 0,
        }));

        let span = info_span!("monitor", monitor_id = config.id);
        let handle = self.tasks.spawn(
            monitor_loop(
                config.clone(),
                self.context.clone(),
                cancel.clone(),
                info.clone(),
                gate,
            )
            .instrument(span),
        );

        self.task_owners.insert(handle.id(), config.id);
        self.slots.insert(
            config.id,
            Slot {
                config,
                cancel,
                task_id: handle.id(),
                info,
            },
        );
    }

    fn unschedule(&mut self, id: MonitorId, reason: &str) {
        if let Some(slot) = self.slots.remove(&id) {
            info!("unscheduling monitor {id}: {reason}");
            slot.cancel.cancel();
            // a faulted slot has no task left to release it
            self.release_gate(id);
        }
    }

    /// Handle a finished monitor task
    fn reap(&mut self, joined: Result<(task::Id, ()), JoinError>) {
        let (task_id, error) = match joined {
            Ok((task_id, ())) => (task_id, None),
            Err(e) => (e.id(), Some(e)),
        };

        let Some(monitor_id) = self.task_owners.remove(&task_id) else {
            return;
        };

        // replaced or unscheduled generation
        let Some(slot) = self
            .slots
            .get(&monitor_id)
            .filter(|slot| slot.task_id == task_id)
        else {
            self.release_gate(monitor_id);
            return;
        };

        match error {
            Some(e) if e.is_panic() => {
                error!("probe loop of monitor {monitor_id} panicked, schedule halted: {e}");
            }
            Some(e) => {
                error!("probe loop of monitor {monitor_id} aborted, schedule halted: {e}");
            }
            None => {
                error!("probe loop of monitor {monitor_id} exited unexpectedly, schedule halted");
            }
        }
        update(&slot.info, |info| info.state = SlotState::Faulted);
    }

    /// Drop the gate of a monitor nothing refers to anymore
    fn release_gate(&mut self, monitor_id: MonitorId) {
        let in_use = self.slots.contains_key(&monitor_id)
            || self.task_owners.values().any(|owner| *owner == monitor_id);
        if !in_use && self.gates.remove(&monitor_id).is_some() {
            trace!("released gate of monitor {monitor_id}");
        }
    }

    fn status(&self) -> Vec<ScheduledMonitor> {
        let mut status: Vec<ScheduledMonitor> = self
            .slots
            .values()
            .map(|slot| {
                let info = slot.info.lock().unwrap_or_else(PoisonError::into_inner);
                ScheduledMonitor {
                    config: slot.config.clone(),
                    state: info.state,
                    last_probe_at: info.last_probe_at,
                    skipped_ticks: info.skipped_ticks,
                }
            })
            .collect();
        status.sort_by_key(|m| m.config.id);
        status
    }
}

fn slot_state(info: &SharedSlotInfo) -> SlotState {
    info.lock().unwrap_or_else(PoisonError::into_inner).state
}

async fn next_change(
    changes: &mut Option<broadcast::Receiver<RegistryChange>>,
) -> Result<RegistryChange, broadcast::error::RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Probe loop of a single monitor
async fn monitor_loop(
    config: MonitorConfig,
    ctx: ProbeContext,
    cancel: CancellationToken,
    info: SharedSlotInfo,
    gate: Gate,
) {
    let period = Duration::from_secs(config.check_interval);
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // previous generation of this monitor may still be probing
        let _gate = tokio::select! {
            _ = cancel.cancelled() => break,
            guard = gate.lock() => guard,
        };

        let _permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = ctx.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        update(&info, |info| info.state = SlotState::Probing);
        let started = Instant::now();

        // removal lets the probe finish, shutdown aborts it
        let result = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            result = ctx.prober.probe(&config) => result,
        };

        let missed = (started.elapsed().as_secs_f64() / period.as_secs_f64()) as u64;
        update(&info, |info| {
            info.state = SlotState::Idle;
            info.last_probe_at = Some(result.timestamp);
            info.skipped_ticks += missed;
        });
        if missed > 0 {
            debug!("probe outlasted the interval, skipped {missed} ticks");
        }

        if cancel.is_cancelled() {
            debug!("discarding result of unscheduled monitor");
            break;
        }

        if ctx.results.send(result).await.is_err() {
            warn!("result channel closed, stopping probe loop");
            break;
        }
    }

    trace!("probe loop stopped");
}

/// Handle for controlling the SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
    shutdown: CancellationToken,
}

impl SchedulerHandle {
    /// Spawn the scheduler
    ///
    /// The scheduler loads the registry right away and probes every active
    /// monitor once before settling into its interval.
    pub fn spawn(
        settings: SchedulerSettings,
        registry: Arc<dyn MonitorRegistry>,
        changes: Option<broadcast::Receiver<RegistryChange>>,
        prober: Arc<dyn Probe>,
        detector: DetectorHandle,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let shutdown = CancellationToken::new();

        let actor = SchedulerActor::new(
            settings,
            registry,
            changes,
            prober,
            detector,
            cmd_rx,
            shutdown.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            shutdown,
        }
    }

    /// Apply a registry change without waiting for the next refresh
    pub async fn apply_change(&self, change: RegistryChange) -> Result<()> {
        self.sender.send(SchedulerCommand::Apply(change)).await?;
        Ok(())
    }

    /// Reload the registry now, returns the number of scheduled monitors
    pub async fn refresh_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::RefreshNow { respond_to: tx })
            .await?;
        rx.await?
    }

    /// Scheduling state of every monitor, ordered by id
    pub async fn status(&self) -> Result<Vec<ScheduledMonitor>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::GetStatus { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    /// Token cancelled when the scheduler shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel all timers and in-flight probes and wait until they are gone
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SchedulerCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        } else {
            self.shutdown.cancel();
        }
    }
}
