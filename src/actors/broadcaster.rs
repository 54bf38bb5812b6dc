//! BroadcasterActor - Fans monitor events out to live observers
//!
//! Every observer connection owns a bounded mpsc buffer. The actor converts
//! each `MonitorEvent` into a `LiveMessage` once and `try_send`s it to every
//! connection:
//!
//! - **Full buffer**: the observer is too slow, the connection is dropped
//!   instead of stalling everybody else.
//! - **Closed buffer**: the observer went away, the connection is removed.
//!
//! Delivery is best-effort and at most once per event and connection; there
//! is no replay after a reconnect. Per connection, messages arrive in the
//! order the detector produced the events.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use super::messages::{BroadcasterCommand, LiveMessage, MonitorEvent};
use crate::config::LiveConfig;

/// Broadcaster settings
#[derive(Debug, Clone)]
pub struct BroadcasterSettings {
    /// Outbound buffer per connection
    pub connection_buffer: usize,

    /// How often dead connections are swept
    pub sweep_interval: Duration,
}

impl From<&LiveConfig> for BroadcasterSettings {
    fn from(config: &LiveConfig) -> Self {
        Self {
            connection_buffer: config.connection_buffer,
            sweep_interval: Duration::from_secs(config.heartbeat_interval_secs),
        }
    }
}

pub struct BroadcasterActor {
    event_rx: broadcast::Receiver<MonitorEvent>,

    command_rx: mpsc::Receiver<BroadcasterCommand>,

    connections: HashMap<u64, mpsc::Sender<LiveMessage>>,

    next_connection_id: u64,

    settings: BroadcasterSettings,
}

impl BroadcasterActor {
    pub fn new(
        settings: BroadcasterSettings,
        event_rx: broadcast::Receiver<MonitorEvent>,
        command_rx: mpsc::Receiver<BroadcasterCommand>,
    ) -> Self {
        Self {
            event_rx,
            command_rx,
            connections: HashMap::new(),
            next_connection_id: 1,
            settings,
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting broadcaster");

        let mut sweep = time::interval(self.settings.sweep_interval);

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Ok(event) => self.fan_out(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("broadcaster lagged, {skipped} events were not delivered");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("event channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = sweep.tick() => self.sweep(),

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        BroadcasterCommand::Connect { respond_to } => {
                            let connection = self.connect();
                            let _ = respond_to.send(connection);
                        }

                        BroadcasterCommand::Disconnect { connection_id } => {
                            if self.connections.remove(&connection_id).is_some() {
                                debug!("connection {connection_id} disconnected");
                            }
                        }

                        BroadcasterCommand::ConnectionCount { respond_to } => {
                            let _ = respond_to.send(self.connections.len());
                        }

                        BroadcasterCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        // dropping the senders ends every observer stream
        let open = self.connections.len();
        self.connections.clear();
        info!("broadcaster stopped, closed {open} connections");
    }

    fn connect(&mut self) -> (u64, mpsc::Receiver<LiveMessage>) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let (tx, rx) = mpsc::channel(self.settings.connection_buffer.max(1));
        self.connections.insert(id, tx);

        debug!(
            "connection {id} registered ({} active)",
            self.connections.len()
        );
        (id, rx)
    }

    fn fan_out(&mut self, event: &MonitorEvent) {
        if self.connections.is_empty() {
            return;
        }

        let message = event.to_live_message();
        trace!(
            "delivering {} of monitor {} to {} connections",
            message.kind,
            event.monitor_id(),
            self.connections.len()
        );

        self.connections
            .retain(|id, tx| match tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("connection {id} is not keeping up, dropping it");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("connection {id} is gone");
                    false
                }
            });
    }

    /// Drop connections whose receiving side went away
    fn sweep(&mut self) {
        let before = self.connections.len();
        self.connections.retain(|_, tx| !tx.is_closed());

        let evicted = before - self.connections.len();
        if evicted > 0 {
            debug!("evicted {evicted} closed connections");
        }
    }
}

/// Handle for controlling the BroadcasterActor
#[derive(Clone)]
pub struct BroadcasterHandle {
    sender: mpsc::Sender<BroadcasterCommand>,
}

impl BroadcasterHandle {
    pub fn spawn(settings: BroadcasterSettings, event_rx: broadcast::Receiver<MonitorEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = BroadcasterActor::new(settings, event_rx, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Register an observer
    ///
    /// The receiver yields every event published after this call. It ends
    /// when the observer was dropped for being too slow or the broadcaster
    /// stopped.
    pub async fn connect(&self) -> Result<(u64, mpsc::Receiver<LiveMessage>)> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BroadcasterCommand::Connect { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn disconnect(&self, connection_id: u64) {
        let _ = self
            .sender
            .send(BroadcasterCommand::Disconnect { connection_id })
            .await;
    }

    pub async fn connection_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BroadcasterCommand::ConnectionCount { respond_to: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(BroadcasterCommand::Shutdown).await;
    }
}
