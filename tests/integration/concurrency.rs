//! Probe concurrency: the global cap and per-monitor independence

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use apiwatch::{
    actors::{messages::MonitorEvent, prober::Probe},
    monitor::{CheckResult, MonitorConfig},
    registry::InMemoryRegistry,
    storage::MemoryBackend,
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_global_probe_cap() {
    let monitors: Vec<MonitorConfig> = (1..=10)
        .map(|id| test_monitor(id, format!("https://svc{id}.example.com")))
        .collect();
    let registry = Arc::new(InMemoryRegistry::new(monitors));
    let prober = Arc::new(ScriptedProber::always(Scripted::Up).with_delay(Duration::from_secs(2)));
    let (pipeline, mut events) = Pipeline::spawn(
        registry.clone(),
        Some(registry.subscribe()),
        Arc::new(MemoryBackend::new()),
        prober.clone(),
        3,
        2,
    );

    let mut seen = HashSet::new();
    while seen.len() < 10 {
        if let MonitorEvent::CheckResult { result, .. } = next_check(&mut events).await {
            seen.insert(result.monitor_id);
        }
    }

    assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 2);

    pipeline.shutdown().await;
}

/// Hangs for one monitor, answers instantly for every other one
struct StuckProber {
    stuck_id: i64,
}

#[async_trait]
impl Probe for StuckProber {
    async fn probe(&self, config: &MonitorConfig) -> CheckResult {
        if config.id == self.stuck_id {
            std::future::pending::<()>().await;
        }
        CheckResult::up(config.id, config.expected_status, 5)
    }
}

#[tokio::test(start_paused = true)]
async fn test_stuck_monitor_does_not_delay_others() {
    let registry = Arc::new(InMemoryRegistry::new([
        test_monitor(1, "https://stuck.example.com"),
        test_monitor(2, "https://fine.example.com"),
    ]));
    let prober = Arc::new(StuckProber { stuck_id: 1 });
    let (pipeline, mut events) = Pipeline::with_registry(
        &registry,
        Arc::new(MemoryBackend::new()),
        prober,
        3,
    );

    let started = tokio::time::Instant::now();
    for _ in 0..5 {
        match next_check(&mut events).await {
            MonitorEvent::CheckResult { result, .. } => assert_eq!(result.monitor_id, 2),
            other => panic!("unexpected event {other:?}"),
        }
    }
    // first probe immediate, then one per interval
    assert!(started.elapsed() >= Duration::from_secs(40));
    assert!(started.elapsed() < Duration::from_secs(60));

    let status = pipeline.scheduler.status().await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status[0].last_probe_at.is_none());
    assert!(status[1].last_probe_at.is_some());

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_many_monitors_each_probed_once_per_interval() {
    let monitors: Vec<MonitorConfig> = (1..=50)
        .map(|id| test_monitor(id, format!("https://svc{id}.example.com")))
        .collect();
    let registry = Arc::new(InMemoryRegistry::new(monitors));
    let prober = Arc::new(ScriptedProber::always(Scripted::Up));
    let (pipeline, mut events) = Pipeline::with_registry(
        &registry,
        Arc::new(MemoryBackend::new()),
        prober.clone(),
        3,
    );

    // the immediate round plus two interval rounds
    for _ in 0..150 {
        next_check(&mut events).await;
    }

    let status = pipeline.scheduler.status().await.unwrap();
    assert_eq!(status.len(), 50);
    assert!(status.iter().all(|m| m.skipped_ticks == 0));
    assert!(prober.calls() >= 150);

    pipeline.shutdown().await;
}
