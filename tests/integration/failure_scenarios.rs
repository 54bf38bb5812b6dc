//! Degraded collaborators: failing storage, unreachable registry, slow observers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use apiwatch::{
    actors::messages::MonitorEvent,
    monitor::{CheckError, CheckResult, Incident, MonitorConfig, MonitorId},
    registry::{InMemoryRegistry, MonitorRegistry, RegistryError},
    storage::{HealthStatus, MemoryBackend, StorageBackend, StorageError, StorageResult, UptimeStats},
};
use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use uuid::Uuid;

use crate::helpers::*;

/// Backend whose writes always fail with a connection error
#[derive(Default)]
struct BrokenBackend {
    inner: MemoryBackend,
    write_attempts: AtomicUsize,
}

impl BrokenBackend {
    fn fail(&self) -> StorageError {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        StorageError::ConnectionFailed("database is gone".to_string())
    }
}

#[async_trait]
impl StorageBackend for BrokenBackend {
    async fn append_check_results(&self, _results: Vec<CheckResult>) -> StorageResult<()> {
        Err(self.fail())
    }

    async fn open_incident(&self, _incident: &Incident) -> StorageResult<()> {
        Err(self.fail())
    }

    async fn resolve_incident(&self, _id: Uuid, _resolved_at: DateTime<Utc>) -> StorageResult<()> {
        Err(self.fail())
    }

    async fn latest_checks(
        &self,
        monitor_id: MonitorId,
        limit: usize,
    ) -> StorageResult<Vec<CheckResult>> {
        self.inner.latest_checks(monitor_id, limit).await
    }

    async fn checks_since(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<CheckResult>> {
        self.inner.checks_since(monitor_id, since).await
    }

    async fn incidents(&self, monitor_id: MonitorId, limit: usize) -> StorageResult<Vec<Incident>> {
        self.inner.incidents(monitor_id, limit).await
    }

    async fn open_incidents(&self) -> StorageResult<Vec<Incident>> {
        self.inner.open_incidents().await
    }

    async fn uptime(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> StorageResult<UptimeStats> {
        self.inner.uptime(monitor_id, since).await
    }

    async fn cleanup_old_checks(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        self.inner.cleanup_old_checks(before).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Err(StorageError::ConnectionFailed("database is gone".to_string()))
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_storage_outage_does_not_stall_detection() {
    let registry = Arc::new(InMemoryRegistry::new([test_monitor(1, "https://a.example.com")]));
    let backend = Arc::new(BrokenBackend::default());
    let prober = Arc::new(ScriptedProber::always(Scripted::Down(CheckError::Timeout)));
    let (pipeline, mut events) =
        Pipeline::with_registry(&registry, backend.clone(), prober.clone(), 2);

    let (_, mut observer) = pipeline.broadcaster.connect().await.unwrap();

    // detection keeps going while every write fails
    next_event(&mut events, |e| matches!(e, MonitorEvent::IncidentOpened { .. })).await;

    let mut kinds = Vec::new();
    while !kinds.iter().any(|k| k == "incident_opened") {
        let message = tokio::time::timeout(Duration::from_secs(60), observer.recv())
            .await
            .expect("observer starved")
            .expect("observer dropped");
        kinds.push(message.kind);
    }
    assert!(kinds.iter().any(|k| k == "check_result"));

    // the batch and the incident each gave up after three attempts
    let _ = pipeline.storage.flush().await;
    let stats = pipeline.storage.get_stats().await.unwrap();
    assert!(stats.failed_writes >= 2);
    assert_eq!(stats.checks_written, 0);
    assert!(backend.write_attempts.load(Ordering::SeqCst) >= 6);

    pipeline.shutdown().await;
}

/// Registry that can be switched to fail every read
struct FlakyRegistry {
    inner: InMemoryRegistry,
    down: AtomicBool,
}

#[async_trait]
impl MonitorRegistry for FlakyRegistry {
    async fn list_active_monitors(&self) -> Result<Vec<MonitorConfig>, RegistryError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("connection reset".to_string()));
        }
        self.inner.list_active_monitors().await
    }

    async fn list_monitors(&self) -> Result<Vec<MonitorConfig>, RegistryError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("connection reset".to_string()));
        }
        self.inner.list_monitors().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_registry_outage_keeps_previous_schedule() {
    let registry = Arc::new(FlakyRegistry {
        inner: InMemoryRegistry::new([
            test_monitor(1, "https://a.example.com"),
            test_monitor(2, "https://b.example.com"),
        ]),
        down: AtomicBool::new(false),
    });
    let prober = Arc::new(ScriptedProber::always(Scripted::Up));
    let (pipeline, mut events) = Pipeline::spawn(
        registry.clone(),
        None,
        Arc::new(MemoryBackend::new()),
        prober.clone(),
        3,
        8,
    );
    assert_eq!(pipeline.scheduler.refresh_now().await.unwrap(), 2);

    registry.down.store(true, Ordering::SeqCst);
    assert!(pipeline.scheduler.refresh_now().await.is_err());

    let status = pipeline.scheduler.status().await.unwrap();
    assert_eq!(status.len(), 2);

    // both monitors are still probed on schedule
    let calls = prober.calls();
    for _ in 0..4 {
        next_check(&mut events).await;
    }
    assert!(prober.calls() >= calls + 2);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_observer_is_dropped_others_keep_receiving() {
    let monitors: Vec<MonitorConfig> = (1..=20)
        .map(|id| test_monitor(id, format!("https://svc{id}.example.com")))
        .collect();
    let registry = Arc::new(InMemoryRegistry::new(monitors));
    let prober = Arc::new(ScriptedProber::always(Scripted::Up));
    let (pipeline, mut events) = Pipeline::with_registry(
        &registry,
        Arc::new(MemoryBackend::new()),
        prober,
        3,
    );

    let (_, mut slow) = pipeline.broadcaster.connect().await.unwrap();
    let (_, mut fast) = pipeline.broadcaster.connect().await.unwrap();

    // the fast observer drains, the slow one never reads
    let mut received = 0;
    while received < 100 {
        let message = tokio::time::timeout(Duration::from_secs(60), fast.recv())
            .await
            .expect("fast observer starved");
        assert_matches!(message, Some(_));
        received += 1;
    }
    // keep the test's own subscription from lagging
    while events.try_recv().is_ok() {}

    assert_eq!(pipeline.broadcaster.connection_count().await.unwrap(), 1);

    // whatever was buffered is still readable, then the stream ends
    let mut buffered = 0;
    while slow.recv().await.is_some() {
        buffered += 1;
    }
    assert_eq!(buffered, 64);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_checks_flushed_on_batch_timer() {
    let registry = Arc::new(InMemoryRegistry::new([test_monitor(3, "https://c.example.com")]));
    let backend = Arc::new(MemoryBackend::new());
    let prober = Arc::new(ScriptedProber::always(Scripted::Up));
    let (pipeline, mut events) =
        Pipeline::with_registry(&registry, backend.clone(), prober, 3);

    next_check(&mut events).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(backend.latest_checks(3, 10).await.unwrap().len(), 1);
    let stats = pipeline.storage.get_stats().await.unwrap();
    assert_eq!(stats.buffer_size, 0);
    assert!(stats.flush_count >= 1);

    pipeline.shutdown().await;
}
