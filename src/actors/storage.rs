//! StorageActor - Persists check results and incidents
//!
//! ## Batching Strategy
//!
//! Check results are batched for efficiency:
//! - **Size trigger**: Flush after 100 results
//! - **Time trigger**: Flush after 5 seconds
//!
//! Incident transitions are written as soon as they arrive, they are rare
//! and the query side expects to see them right away.
//!
//! ## Failure handling
//!
//! Persistence is decoupled from probing: a failing backend never stalls the
//! scheduler or the detector. Transient errors are retried with exponential
//! backoff, after the last attempt the write is logged and dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::{MonitorEvent, StorageCommand, StorageStats};
use crate::monitor::{CheckResult, Incident};
use crate::storage::{StorageBackend, StorageError, StorageResult};

/// Batch size trigger - flush after this many results
const BATCH_SIZE_TRIGGER: usize = 100;

/// Batch time trigger - flush after this duration
const BATCH_TIME_TRIGGER: Duration = Duration::from_secs(5);

/// Cleanup interval - run retention cleanup daily
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Attempts per write, including the first one
const WRITE_ATTEMPTS: u32 = 3;

/// Backoff before the first retry, doubled on each further retry
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

pub struct StorageActor {
    backend: Arc<dyn StorageBackend>,

    /// Results waiting to be flushed
    batch_buffer: Vec<CheckResult>,

    command_rx: mpsc::Receiver<StorageCommand>,

    event_rx: broadcast::Receiver<MonitorEvent>,

    /// Retention period in days, `None` keeps everything
    retention_days: Option<u32>,

    stats: StorageStats,
}

impl StorageActor {
    pub fn new(
        command_rx: mpsc::Receiver<StorageCommand>,
        event_rx: broadcast::Receiver<MonitorEvent>,
        backend: Arc<dyn StorageBackend>,
        retention_days: Option<u32>,
    ) -> Self {
        if let Some(days) = retention_days {
            debug!("retention cleanup enabled: {} days", days);
        }

        Self {
            backend,
            batch_buffer: Vec::with_capacity(BATCH_SIZE_TRIGGER),
            command_rx,
            event_rx,
            retention_days,
            stats: StorageStats::default(),
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting storage actor");

        let mut flush_interval = time::interval(BATCH_TIME_TRIGGER);
        // first tick of the cleanup interval runs the startup cleanup
        let mut cleanup_interval = time::interval(CLEANUP_INTERVAL);
        let has_retention = self.retention_days.is_some();

        loop {
            tokio::select! {
                // events queued before a command are handled first
                biased;

                event = self.event_rx.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("storage actor lagged, {skipped} events were not persisted");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("event channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = flush_interval.tick() => {
                    if !self.batch_buffer.is_empty() {
                        trace!("time-based flush triggered ({} results)", self.batch_buffer.len());
                        self.flush_batch().await;
                    }
                }

                _ = cleanup_interval.tick(), if has_retention => {
                    debug!("retention cleanup triggered");
                    self.run_cleanup().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        if !self.batch_buffer.is_empty() {
            debug!(
                "final flush before shutdown ({} results)",
                self.batch_buffer.len()
            );
            self.flush_batch().await;
        }

        debug!("closing backend");
        if let Err(e) = self.backend.close().await {
            error!("error closing backend: {}", e);
        }

        debug!("storage actor stopped");
    }

    async fn handle_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::CheckResult { result, .. } => {
                trace!(
                    "buffering check result of monitor {} at {}",
                    result.monitor_id, result.timestamp
                );
                self.batch_buffer.push(result);

                if self.batch_buffer.len() >= BATCH_SIZE_TRIGGER {
                    trace!(
                        "size-based flush triggered ({} results)",
                        self.batch_buffer.len()
                    );
                    self.flush_batch().await;
                }
            }

            MonitorEvent::IncidentOpened { incident, .. } => {
                // the results that led to the incident go first
                self.flush_batch().await;
                self.persist_opened(&incident).await;
            }

            MonitorEvent::IncidentResolved { incident, .. } => {
                self.flush_batch().await;
                self.persist_resolved(&incident).await;
            }

            MonitorEvent::StatsInvalidated { .. } => {}
        }
    }

    /// Flush the batch buffer to the backend
    async fn flush_batch(&mut self) {
        if self.batch_buffer.is_empty() {
            return;
        }

        let batch: Vec<CheckResult> = self.batch_buffer.drain(..).collect();
        let batch_size = batch.len();
        debug!("flushing {} check results to backend", batch_size);

        let backend = self.backend.clone();
        let written = with_retry("append check results", || {
            backend.append_check_results(batch.clone())
        })
        .await;

        match written {
            Ok(()) => {
                self.stats.flush_count += 1;
                self.stats.checks_written += batch_size as u64;
                trace!(
                    "flush #{} complete ({} results)",
                    self.stats.flush_count, batch_size
                );
            }
            Err(e) => {
                error!("dropping {} check results: {}", batch_size, e);
                self.stats.failed_writes += 1;
            }
        }
    }

    async fn persist_opened(&mut self, incident: &Incident) {
        let backend = self.backend.clone();
        if let Err(e) = with_retry("open incident", || backend.open_incident(incident)).await {
            error!("failed to persist incident {}: {}", incident.id, e);
            self.stats.failed_writes += 1;
        }
    }

    async fn persist_resolved(&mut self, incident: &Incident) {
        let Some(resolved_at) = incident.resolved_at else {
            warn!("resolved incident {} carries no resolution time", incident.id);
            return;
        };

        let backend = self.backend.clone();
        let resolved = with_retry("resolve incident", || {
            backend.resolve_incident(incident.id, resolved_at)
        })
        .await;

        let outcome = match resolved {
            // the opening write was lost, store the closed incident whole
            Err(StorageError::NotFound(_)) => {
                debug!("incident {} unknown to backend, inserting it resolved", incident.id);
                with_retry("open incident", || backend.open_incident(incident)).await
            }
            other => other,
        };

        if let Err(e) = outcome {
            error!("failed to persist resolution of incident {}: {}", incident.id, e);
            self.stats.failed_writes += 1;
        }
    }

    /// Delete check results older than the retention period
    async fn run_cleanup(&mut self) {
        let Some(retention_days) = self.retention_days else {
            return;
        };

        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        debug!("running retention cleanup (deleting data before {})", cutoff);

        match self.backend.cleanup_old_checks(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!("retention cleanup complete: deleted {} old check results", deleted);
                } else {
                    trace!("retention cleanup: nothing to delete");
                }
                self.stats.total_checks_deleted += deleted as u64;
            }
            Err(e) => {
                // retried on the next interval
                error!("failed to clean up old check results: {}", e);
            }
        }

        self.stats.last_cleanup_time = Some(Utc::now());
    }

    /// Returns `false` when the actor should stop
    async fn handle_command(&mut self, cmd: StorageCommand) -> bool {
        match cmd {
            StorageCommand::Flush { respond_to } => {
                debug!("manual flush requested");
                let failed_before = self.stats.failed_writes;
                self.flush_batch().await;

                let result = if self.stats.failed_writes > failed_before {
                    Err(anyhow::anyhow!("flush failed, see logs"))
                } else {
                    Ok(())
                };
                let _ = respond_to.send(result);
                true
            }

            StorageCommand::GetStats { respond_to } => {
                let mut stats = self.stats.clone();
                stats.buffer_size = self.batch_buffer.len();
                let _ = respond_to.send(stats);
                true
            }

            StorageCommand::Shutdown => {
                debug!("received shutdown command");
                false
            }
        }
    }
}

/// Run a write, retrying transient failures with exponential backoff
async fn with_retry<F, Fut>(operation: &str, mut write: F) -> StorageResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<()>>,
{
    let mut attempt = 0;
    loop {
        match write().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt + 1 < WRITE_ATTEMPTS => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                warn!("{operation} failed (attempt {}): {e}, retrying in {delay:?}", attempt + 1);
                time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Handle for controlling the StorageActor
#[derive(Clone)]
pub struct StorageHandle {
    sender: mpsc::Sender<StorageCommand>,
}

impl StorageHandle {
    /// Spawn a storage actor writing to the given backend
    pub fn spawn(
        event_rx: broadcast::Receiver<MonitorEvent>,
        backend: Arc<dyn StorageBackend>,
        retention_days: Option<u32>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = StorageActor::new(cmd_rx, event_rx, backend, retention_days);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Manually flush the write buffer
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(StorageCommand::Flush { respond_to: tx })
            .await?;

        rx.await??;
        Ok(())
    }

    /// Get storage statistics
    pub async fn get_stats(&self) -> Option<StorageStats> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(StorageCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Shutdown the storage actor
    ///
    /// Buffered results are flushed before the backend is closed.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(StorageCommand::Shutdown).await;
        // resolves once the actor dropped its receiver
        self.sender.closed().await;
    }
}
