//! Persistence across restarts with the SQLite backend

use std::sync::Arc;
use std::time::Duration;

use apiwatch::{
    IncidentPhase,
    actors::{detector::DetectorHandle, messages::MonitorEvent, storage::StorageHandle},
    monitor::{CheckError, CheckResult},
    registry::MonitorRegistry,
    storage::{StorageBackend, sqlite::SqliteBackend},
};
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::helpers::*;

async fn open(dir: &TempDir) -> Arc<SqliteBackend> {
    Arc::new(
        SqliteBackend::new(dir.path().join("apiwatch.db"))
            .await
            .expect("failed to open database"),
    )
}

#[tokio::test]
async fn test_open_incident_survives_restart() {
    let dir = TempDir::new().unwrap();
    // stored with millisecond precision
    let started = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
        - chrono::Duration::minutes(5);

    // first run: three failures open an incident
    let incident = {
        let backend = open(&dir).await;
        let (event_tx, mut events) = broadcast::channel(64);
        let detector = DetectorHandle::spawn(3, vec![], event_tx.clone());
        let storage = StorageHandle::spawn(event_tx.subscribe(), backend.clone(), None);

        for i in 0..3 {
            let result = CheckResult::down(1, CheckError::ConnectionRefused, "refused")
                .at(started + chrono::Duration::seconds(60 * i));
            detector.submit(result).await.unwrap();
        }

        let incident = match next_event(&mut events, |e| {
            matches!(e, MonitorEvent::IncidentOpened { .. })
        })
        .await
        {
            MonitorEvent::IncidentOpened { incident, .. } => incident,
            other => panic!("unexpected event {other:?}"),
        };

        detector.shutdown().await;
        storage.shutdown().await;
        incident
    };
    assert_eq!(incident.opened_at, started);

    // second run: the incident is restored and closed by the next success
    let backend = open(&dir).await;
    let restored = backend.open_incidents().await.unwrap();
    assert_eq!(restored, vec![incident.clone()]);
    assert_eq!(backend.latest_checks(1, 10).await.unwrap().len(), 3);

    let (event_tx, mut events) = broadcast::channel(64);
    let detector = DetectorHandle::spawn(3, restored, event_tx.clone());
    let storage = StorageHandle::spawn(event_tx.subscribe(), backend.clone(), None);

    let state = detector.state(1).await.unwrap().unwrap();
    assert_eq!(state.phase, IncidentPhase::IncidentOpen);

    detector.submit(CheckResult::up(1, 200, 40)).await.unwrap();
    match next_event(&mut events, |e| {
        matches!(e, MonitorEvent::IncidentResolved { .. })
    })
    .await
    {
        MonitorEvent::IncidentResolved { incident: resolved, .. } => {
            assert_eq!(resolved.id, incident.id);
        }
        other => panic!("unexpected event {other:?}"),
    }

    storage.flush().await.unwrap();
    assert!(backend.open_incidents().await.unwrap().is_empty());
    let history = backend.incidents(1, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].resolved_at.is_some());

    let stats = backend.uptime(1, started).await.unwrap();
    assert_eq!(stats.total_checks, 4);
    assert_eq!(stats.successful_checks, 1);
    assert_eq!(stats.total_incidents, 1);
    assert_eq!(stats.ongoing_incidents, 0);

    detector.shutdown().await;
    storage.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_registry_feeds_the_scheduler() {
    let dir = TempDir::new().unwrap();
    let backend = open(&dir).await;

    let mut inactive = test_monitor(2, "https://b.example.com");
    inactive.is_active = false;
    for monitor in [
        test_monitor(1, "https://a.example.com"),
        inactive,
        test_monitor(3, "https://c.example.com"),
    ] {
        backend.upsert_monitor(&monitor).await.unwrap();
    }

    let active = backend.list_active_monitors().await.unwrap();
    assert_eq!(active.len(), 2);
    assert_eq!(active[0], {
        let mut expected = test_monitor(1, "https://a.example.com");
        expected.updated_at = active[0].updated_at;
        expected
    });

    let prober = Arc::new(ScriptedProber::always(Scripted::Up));
    let (pipeline, mut events) = Pipeline::spawn(
        backend.clone(),
        None,
        backend.clone(),
        prober.clone(),
        3,
        8,
    );
    let mut probed = std::collections::HashSet::new();
    while probed.len() < 2 {
        if let MonitorEvent::CheckResult { result, .. } = next_check(&mut events).await {
            probed.insert(result.monitor_id);
        }
    }
    assert_eq!(pipeline.scheduler.refresh_now().await.unwrap(), 2);

    // no change stream: the next refresh tells a deletion from a deactivation
    assert!(backend.delete_monitor(1).await.unwrap());
    let mut paused = test_monitor(3, "https://c.example.com");
    paused.is_active = false;
    backend.upsert_monitor(&paused).await.unwrap();
    assert_eq!(pipeline.scheduler.refresh_now().await.unwrap(), 0);

    assert!(pipeline.detector.state(1).await.unwrap().is_none());
    assert!(pipeline.detector.state(3).await.unwrap().is_some());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_retention_cleanup_on_startup() {
    let dir = TempDir::new().unwrap();
    let backend = open(&dir).await;

    let old = Utc::now() - chrono::Duration::days(10);
    backend
        .append_check_results(vec![
            CheckResult::up(1, 200, 10).at(old),
            CheckResult::up(1, 200, 10),
        ])
        .await
        .unwrap();

    let (event_tx, _) = broadcast::channel(16);
    let storage = StorageHandle::spawn(event_tx.subscribe(), backend.clone(), Some(7));

    let mut cleaned = false;
    for _ in 0..50 {
        let stats = storage.get_stats().await.unwrap();
        if stats.last_cleanup_time.is_some() {
            assert_eq!(stats.total_checks_deleted, 1);
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "startup cleanup did not run");
    assert_eq!(backend.latest_checks(1, 10).await.unwrap().len(), 1);

    storage.shutdown().await;
}
