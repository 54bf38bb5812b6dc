//! Helper functions for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apiwatch::{
    actors::{
        broadcaster::{BroadcasterHandle, BroadcasterSettings},
        detector::DetectorHandle,
        messages::MonitorEvent,
        prober::Probe,
        scheduler::{SchedulerHandle, SchedulerSettings},
        storage::StorageHandle,
    },
    monitor::{CheckError, CheckResult, MonitorConfig, MonitorId},
    registry::{InMemoryRegistry, MonitorRegistry, RegistryChange},
    storage::StorageBackend,
};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Monitor with the shortest allowed interval and a short timeout
pub fn test_monitor(id: MonitorId, url: impl Into<String>) -> MonitorConfig {
    let mut config = MonitorConfig::new(id, url);
    config.check_interval = 10;
    config.timeout = 2;
    config
}

pub fn scheduler_settings(max_concurrent_probes: usize) -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent_probes,
        registry_refresh: Duration::from_secs(3600),
    }
}

/// All actors wired together the way the hub does it
pub struct Pipeline {
    pub detector: DetectorHandle,
    pub storage: StorageHandle,
    pub broadcaster: BroadcasterHandle,
    pub scheduler: SchedulerHandle,
    pub event_tx: broadcast::Sender<MonitorEvent>,
}

impl Pipeline {
    /// Spawn the pipeline, the returned receiver sees every event from the start
    pub fn spawn(
        registry: Arc<dyn MonitorRegistry>,
        changes: Option<broadcast::Receiver<RegistryChange>>,
        backend: Arc<dyn StorageBackend>,
        prober: Arc<dyn Probe>,
        threshold: usize,
        max_concurrent_probes: usize,
    ) -> (Self, broadcast::Receiver<MonitorEvent>) {
        let (event_tx, event_rx) = broadcast::channel(1024);

        let detector = DetectorHandle::spawn(threshold, vec![], event_tx.clone());
        let storage = StorageHandle::spawn(event_tx.subscribe(), backend, None);
        let broadcaster = BroadcasterHandle::spawn(
            BroadcasterSettings {
                connection_buffer: 64,
                sweep_interval: Duration::from_secs(15),
            },
            event_tx.subscribe(),
        );
        let scheduler = SchedulerHandle::spawn(
            scheduler_settings(max_concurrent_probes),
            registry,
            changes,
            prober,
            detector.clone(),
        );

        (
            Self {
                detector,
                storage,
                broadcaster,
                scheduler,
                event_tx,
            },
            event_rx,
        )
    }

    /// Pipeline around an in-memory registry with change notifications
    pub fn with_registry(
        registry: &Arc<InMemoryRegistry>,
        backend: Arc<dyn StorageBackend>,
        prober: Arc<dyn Probe>,
        threshold: usize,
    ) -> (Self, broadcast::Receiver<MonitorEvent>) {
        Self::spawn(
            registry.clone(),
            Some(registry.subscribe()),
            backend,
            prober,
            threshold,
            8,
        )
    }

    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.detector.shutdown().await;
        self.broadcaster.shutdown().await;
        self.storage.shutdown().await;
    }
}

/// Wait for the next event matching the predicate
pub async fn next_event(
    rx: &mut broadcast::Receiver<MonitorEvent>,
    mut matches: impl FnMut(&MonitorEvent) -> bool,
) -> MonitorEvent {
    let wait = async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), wait)
        .await
        .expect("timed out waiting for event")
}

pub async fn next_check(rx: &mut broadcast::Receiver<MonitorEvent>) -> MonitorEvent {
    next_event(rx, |e| matches!(e, MonitorEvent::CheckResult { .. })).await
}

/// Scripted probe outcome
#[derive(Debug, Clone, Copy)]
pub enum Scripted {
    Up,
    Down(CheckError),
    /// Response with this status, a failure unless the monitor expects it
    Status(u16),
}

/// Prober replaying a script without touching the network
///
/// Tracks how many probes run concurrently and how many were aborted.
pub struct ScriptedProber {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    delay: Duration,
    pub calls: AtomicUsize,
    pub completed: AtomicUsize,
    pub aborted: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(script: impl IntoIterator<Item = Scripted>, fallback: Scripted) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn always(outcome: Scripted) -> Self {
        Self::new([], outcome)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Counts a probe as aborted when dropped before completion
struct InFlight<'a> {
    prober: &'a ScriptedProber,
    done: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.prober.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.done {
            self.prober.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Probe for ScriptedProber {
    async fn probe(&self, config: &MonitorConfig) -> CheckResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let mut guard = InFlight {
            prober: self,
            done: false,
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        self.completed.fetch_add(1, Ordering::SeqCst);
        guard.done = true;

        match outcome {
            Scripted::Up => CheckResult::up(config.id, config.expected_status, 25),
            Scripted::Status(status) if status == config.expected_status => {
                CheckResult::up(config.id, status, 25)
            }
            Scripted::Down(error) => CheckResult::down(config.id, error, error.as_str()),
            Scripted::Status(status) => {
                CheckResult::unexpected_status(config.id, config.expected_status, status, 25)
            }
        }
    }
}
