use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use apiwatch::{
    actors::{
        broadcaster::BroadcasterHandle, detector::DetectorHandle, prober::HttpProber,
        scheduler::SchedulerHandle, storage::StorageHandle,
    },
    config::{Config, StorageConfig, read_config_file},
    registry::{InMemoryRegistry, MonitorRegistry, RegistryChange},
    stats::StatsCache,
    storage::{MemoryBackend, StorageBackend},
};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log level of the checker
    #[arg(long, env = "APIWATCH_LOG", default_value = "debug")]
    log_level: LevelFilter,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("apiwatch", level),
        ("apiwatch_hub", level),
        ("tower_http", LevelFilter::INFO),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

/// Storage backend, monitor registry and optional change stream
struct Storage {
    backend: Arc<dyn StorageBackend>,
    registry: Arc<dyn MonitorRegistry>,
    changes: Option<broadcast::Receiver<RegistryChange>>,
    retention_days: Option<u32>,
}

fn in_memory(config: &Config) -> Storage {
    let registry = Arc::new(InMemoryRegistry::new(config.monitors.clone()));
    Storage {
        backend: Arc::new(MemoryBackend::new()),
        changes: Some(registry.subscribe()),
        registry,
        retention_days: None,
    }
}

async fn open_storage(config: &Config) -> anyhow::Result<Storage> {
    match &config.storage {
        StorageConfig::None => {
            info!("using in-memory storage, history is lost on restart");
            Ok(in_memory(config))
        }

        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite {
            path,
            retention_days,
        } => {
            info!("using SQLite storage at {}", path.display());
            let backend = Arc::new(
                apiwatch::storage::sqlite::SqliteBackend::new(path)
                    .await
                    .context("failed to open SQLite database")?,
            );

            for monitor in &config.monitors {
                backend
                    .upsert_monitor(monitor)
                    .await
                    .with_context(|| format!("failed to seed monitor {}", monitor.id))?;
            }

            Ok(Storage {
                backend: backend.clone(),
                registry: backend,
                changes: None,
                retention_days: Some(*retention_days),
            })
        }

        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            warn!("built without SQLite support, falling back to in-memory storage");
            Ok(in_memory(config))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.log_level);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let Storage {
        backend,
        registry,
        changes,
        retention_days,
    } = open_storage(&config).await?;

    let restored = match backend.open_incidents().await {
        Ok(incidents) => incidents,
        Err(e) => {
            warn!("could not restore open incidents: {e}");
            Vec::new()
        }
    };
    debug!("restored {} open incidents", restored.len());

    let (event_tx, _) = broadcast::channel(config.live.event_channel_capacity);

    let detector = DetectorHandle::spawn(
        config.checker.failure_threshold,
        restored,
        event_tx.clone(),
    );
    let storage = StorageHandle::spawn(event_tx.subscribe(), backend.clone(), retention_days);
    let broadcaster = BroadcasterHandle::spawn((&config.live).into(), event_tx.subscribe());

    let stats = Arc::new(StatsCache::new(backend.clone(), registry.clone()));
    let invalidation = stats.spawn_invalidation(event_tx.subscribe());

    let prober = Arc::new(HttpProber::new(
        &config.checker.user_agent,
        Duration::from_secs(config.checker.connect_timeout_secs),
    )?);
    let scheduler = SchedulerHandle::spawn(
        (&config.checker).into(),
        registry.clone(),
        changes,
        prober,
        detector.clone(),
    );

    #[cfg(feature = "api")]
    let api_shutdown = tokio_util::sync::CancellationToken::new();

    #[cfg(feature = "api")]
    {
        let state = apiwatch::api::ApiState {
            scheduler: scheduler.clone(),
            detector: detector.clone(),
            broadcaster: broadcaster.clone(),
            storage: storage.clone(),
            backend: backend.clone(),
            registry: registry.clone(),
            stats: stats.clone(),
            live: config.live.clone(),
        };
        apiwatch::api::spawn_api_server(config.api.clone(), state, api_shutdown.clone())
            .await
            .context("failed to start API server")?;
    }

    info!("checker running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    #[cfg(feature = "api")]
    api_shutdown.cancel();

    // probes first, then drain the pipeline behind them
    scheduler.shutdown().await;
    detector.shutdown().await;
    broadcaster.shutdown().await;
    storage.shutdown().await;
    invalidation.abort();

    info!("bye");
    Ok(())
}
