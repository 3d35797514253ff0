//! Subscription multiplexer service
//!
//! One task owns the socket and the registry. Callers talk to it through a
//! command channel, so the registry has a single writer. Subscriptions made
//! while disconnected are registered at once and sent on the next connect;
//! every connect resends all of them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::protocol::{Notification, RpcMessage};
use super::registry::{SubscriptionId, SubscriptionRegistry};
use crate::error::{Result, SyncError};
use crate::telemetry::{self, RPC_COMPONENT};
use crate::websocket::{ConnectionState, ReconnectPolicy, WebSocketClient};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MultiplexerSettings {
    pub endpoint: String,
    pub policy: ReconnectPolicy,
}

/// A live logical subscription
///
/// Notifications arrive in server order. The channel closes when the
/// subscription is removed or the multiplexer stops.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
enum Command {
    Subscribe {
        id: SubscriptionId,
        method: String,
        params: Value,
        sink: mpsc::UnboundedSender<Notification>,
    },
    Unsubscribe(SubscriptionId),
}

/// Handle to a running multiplexer
pub struct Multiplexer {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    status: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Multiplexer {
    /// Spawn the multiplexer task; must be called within a tokio runtime
    pub fn open(settings: MultiplexerSettings) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = MultiplexerWorker {
            client: WebSocketClient::new(&settings.endpoint),
            settings,
            registry: SubscriptionRegistry::new(),
            commands: command_rx,
            status_tx,
        };
        let task = tokio::spawn(worker.run(shutdown_rx));

        Self {
            commands,
            next_id: AtomicU64::new(1),
            status,
            shutdown,
            task,
        }
    }

    /// Register a subscription; it is sent now if connected, otherwise on connect
    pub fn subscribe(&self, method: &str, params: Value) -> Result<Subscription> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sink, receiver) = mpsc::unbounded_channel();

        self.commands
            .send(Command::Subscribe {
                id,
                method: method.to_string(),
                params,
                sink,
            })
            .map_err(|_| SyncError::Closed)?;

        Ok(Subscription { id, receiver })
    }

    /// Remove a subscription; unknown or already removed ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.commands.send(Command::Unsubscribe(id)).is_err() {
            debug!(local_id = %id, "Multiplexer stopped, nothing to unsubscribe");
        }
    }

    pub fn status(&self) -> ConnectionState {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Stop the multiplexer: cancels any pending reconnect, closes the socket
    /// and waits for the task; no notification is delivered afterwards
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Multiplexer task ended abnormally");
        }
    }
}

struct MultiplexerWorker {
    settings: MultiplexerSettings,
    client: WebSocketClient,
    registry: SubscriptionRegistry,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionState>,
}

impl MultiplexerWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.client.url(), "Starting subscription multiplexer");
        let policy = self.settings.policy;
        let mut failures: u32 = 0;

        loop {
            self.status_tx.send_replace(ConnectionState::Connecting);

            let connected = wait_offline(
                self.client.connect(policy.handshake_timeout),
                &mut self.registry,
                &mut self.commands,
                &mut shutdown,
            )
            .await;

            let err = match connected {
                None => break,
                Some(Ok(())) => {
                    failures = 0;
                    self.status_tx.send_replace(ConnectionState::Connected);
                    info!(subscriptions = self.registry.len(), "Multiplexer connected, resubscribing");
                    match self.serve(&mut shutdown).await {
                        None => break,
                        Some(err) => err,
                    }
                }
                Some(Err(err)) => err,
            };

            let unacked = self.registry.pending_requests();
            self.client.close().await;
            self.registry.reset_connection();
            self.status_tx.send_replace(ConnectionState::Disconnected);
            failures += 1;
            telemetry::RECONNECTS.with_label_values(&[RPC_COMPONENT]).inc();

            if !err.is_transient() || !policy.should_retry(failures) {
                let reason = format!(
                    "{} (last error: {})",
                    SyncError::MaxReconnectAttemptsExceeded(failures),
                    err
                );
                error!(reason = %reason, "Multiplexer failed");
                self.status_tx.send_replace(ConnectionState::Failed(reason));
                return;
            }

            let delay = policy.delay_for(failures);
            warn!(
                error = %err,
                attempt = failures,
                unacked,
                delay_ms = delay.as_millis() as u64,
                "Multiplexer disconnected, reconnecting"
            );

            let waited = wait_offline(
                sleep(delay),
                &mut self.registry,
                &mut self.commands,
                &mut shutdown,
            )
            .await;
            if waited.is_none() {
                break;
            }
        }

        let _ = timeout(CLOSE_TIMEOUT, self.client.close()).await;
        self.status_tx.send_replace(ConnectionState::Disconnected);
        info!("Multiplexer closed");
    }

    /// Run one connected session; `None` means shutdown was requested
    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<SyncError> {
        for request in self.registry.resubscribe_all() {
            if let Err(e) = self.client.send_text(request.to_text()).await {
                return Some(e);
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => return None,
                frame = self.client.recv() => match frame {
                    Ok(Some(text)) => {
                        if let Err(e) = self.handle_frame(&text).await {
                            return Some(e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Some(e),
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.apply_online(command).await {
                            return Some(e);
                        }
                    }
                    None => return None,
                },
            }
        }
    }

    async fn handle_frame(&mut self, raw: &str) -> Result<()> {
        let msg = match RpcMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                telemetry::MALFORMED_MESSAGES
                    .with_label_values(&[RPC_COMPONENT])
                    .inc();
                warn!(error = %e, "Dropping malformed RPC message");
                return Ok(());
            }
        };

        if let Some(request) = self.registry.route(msg) {
            self.client.send_text(request.to_text()).await?;
        }
        Ok(())
    }

    async fn apply_online(&mut self, command: Command) -> Result<()> {
        let request = match command {
            Command::Subscribe {
                id,
                method,
                params,
                sink,
            } => {
                self.registry.register(id, &method, params, sink);
                self.registry.subscribe_request(id)
            }
            Command::Unsubscribe(id) => self.registry.remove(id, true),
        };

        if let Some(request) = request {
            self.client.send_text(request.to_text()).await?;
        }
        Ok(())
    }
}

fn apply_offline(registry: &mut SubscriptionRegistry, command: Command) {
    match command {
        Command::Subscribe {
            id,
            method,
            params,
            sink,
        } => {
            debug!(local_id = %id, method = %method, "Queued subscription until connected");
            registry.register(id, &method, params, sink);
        }
        Command::Unsubscribe(id) => {
            registry.remove(id, false);
        }
    }
}

/// Drive `fut` while applying commands to the registry without a connection
///
/// Returns `None` on shutdown or when every handle is gone.
async fn wait_offline<F: Future>(
    fut: F,
    registry: &mut SubscriptionRegistry,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return None,
            output = &mut fut => return Some(output),
            command = commands.recv() => match command {
                Some(command) => apply_offline(registry, command),
                None => return None,
            },
        }
    }
}
