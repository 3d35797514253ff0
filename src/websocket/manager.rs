//! Book stream connection
//!
//! One task owns the depth socket and the reconciler. Every (re)connect resets
//! the reconciler, buffers diffs while the snapshot is fetched, reconciles, then
//! applies diffs live. Failures enter a bounded backoff; exhausting it leaves
//! the connection in `Failed`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::{ConnectionState, ReconnectPolicy, WebSocketClient};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::orderbook::{DiffOutcome, OrderBookReconciler, OrderBookState};
use crate::parser::ParsedMessage;
use crate::publisher::Publisher;
use crate::snapshot::SnapshotSource;
use crate::telemetry::{self, BOOK_COMPONENT};

/// Silence on the socket after which a keepalive ping is sent
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(45);
/// Consecutive silent periods tolerated before the connection is considered dead
const MAX_MISSED_RECV: u32 = 2;
/// Bound on the close handshake during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for one book stream
#[derive(Debug, Clone)]
pub struct BookStreamSettings {
    pub symbol: String,
    pub ws_endpoint: String,
    pub depth_levels: usize,
    pub max_buffered_diffs: usize,
    pub max_resync_attempts: u32,
    pub policy: ReconnectPolicy,
    pub recv_timeout: Duration,
}

impl BookStreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            symbol: config.symbol.clone(),
            ws_endpoint: config.ws_endpoint.clone(),
            depth_levels: config.depth_levels,
            max_buffered_diffs: config.max_buffered_diffs,
            max_resync_attempts: config.max_resync_attempts,
            policy: config.reconnect_policy(),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    /// Combined-stream URL of the 100ms depth diff stream
    pub fn stream_url(&self) -> String {
        format!(
            "{}/stream?streams={}@depth@100ms",
            self.ws_endpoint.trim_end_matches('/'),
            self.symbol.to_lowercase()
        )
    }
}

/// Handle to a running book stream
///
/// The book is only reachable through read-only snapshots; the driving task is
/// the single writer.
pub struct StreamConnection {
    status: watch::Receiver<ConnectionState>,
    book: watch::Receiver<Option<Arc<OrderBookState>>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    publisher_task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    /// Spawn the stream task; must be called within a tokio runtime
    pub fn open<S: SnapshotSource>(settings: BookStreamSettings, source: S) -> Self {
        Self::open_with_publisher(settings, source, None)
    }

    /// Like `open`, additionally forwarding published states to `publisher`
    ///
    /// The publisher runs in its own task fed by the book watch channel, so a
    /// slow IPC peer never holds up diff processing.
    pub fn open_with_publisher<S: SnapshotSource>(
        settings: BookStreamSettings,
        source: S,
        publisher: Option<Arc<Publisher>>,
    ) -> Self {
        let (status_tx, status) = watch::channel(ConnectionState::Disconnected);
        let (book_tx, book) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let publisher_task = publisher.map(|publisher| tokio::spawn(publisher.run(book.clone())));

        let worker = StreamWorker {
            client: WebSocketClient::new(&settings.stream_url()),
            reconciler: OrderBookReconciler::new(
                &settings.symbol,
                settings.depth_levels,
                settings.max_buffered_diffs,
            ),
            settings,
            source,
            status_tx,
            book_tx,
        };
        let task = tokio::spawn(worker.run(shutdown_rx));

        Self {
            status,
            book,
            shutdown,
            task,
            publisher_task,
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

    /// Latest consistent book, if one has been published
    pub fn book(&self) -> Option<Arc<OrderBookState>> {
        self.book.borrow().clone()
    }

    pub fn watch_book(&self) -> watch::Receiver<Option<Arc<OrderBookState>>> {
        self.book.clone()
    }

    /// Stop the stream: cancels any pending reconnect, closes the socket and
    /// waits for the task, after which no further state is published
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Book stream task ended abnormally");
        }
        // the book sender is gone, so the publisher drains and stops
        if let Some(publisher) = self.publisher_task {
            if let Err(e) = publisher.await {
                error!(error = %e, "Publisher task ended abnormally");
            }
        }
    }
}

struct StreamWorker<S> {
    settings: BookStreamSettings,
    source: S,
    client: WebSocketClient,
    reconciler: OrderBookReconciler,
    status_tx: watch::Sender<ConnectionState>,
    book_tx: watch::Sender<Option<Arc<OrderBookState>>>,
}

impl<S: SnapshotSource> StreamWorker<S> {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(symbol = %self.settings.symbol, url = %self.client.url(), "Starting book stream");
        let policy = self.settings.policy;
        let mut failures: u32 = 0;

        loop {
            self.status_tx.send_replace(ConnectionState::Connecting);

            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.session(&mut failures) => result,
            };
            let err = match result {
                Ok(()) => SyncError::WebSocketConnection("Stream ended".to_string()),
                Err(e) => e,
            };

            self.client.close().await;
            self.status_tx.send_replace(ConnectionState::Disconnected);
            failures += 1;
            telemetry::RECONNECTS.with_label_values(&[BOOK_COMPONENT]).inc();

            if !err.is_transient() || !policy.should_retry(failures) {
                let reason = format!(
                    "{} (last error: {})",
                    SyncError::MaxReconnectAttemptsExceeded(failures),
                    err
                );
                error!(symbol = %self.settings.symbol, reason = %reason, "Book stream failed");
                self.status_tx.send_replace(ConnectionState::Failed(reason));
                return;
            }

            let delay = policy.delay_for(failures);
            warn!(
                error = %err,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Book stream disconnected, reconnecting"
            );

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(delay) => {}
            }
        }

        let _ = timeout(CLOSE_TIMEOUT, self.client.close()).await;
        self.status_tx.send_replace(ConnectionState::Disconnected);
        info!(symbol = %self.settings.symbol, "Book stream closed");
    }

    /// One connection lifetime; only returns on failure
    async fn session(&mut self, failures: &mut u32) -> Result<()> {
        self.client.connect(self.settings.policy.handshake_timeout).await?;
        self.status_tx.send_replace(ConnectionState::Connected);
        self.reconciler.reset();

        loop {
            self.synchronize().await?;
            *failures = 0;
            self.publish();
            self.stream_live().await?;
        }
    }

    /// Fetch snapshots while buffering diffs until one reconciles
    async fn synchronize(&mut self) -> Result<()> {
        let max_attempts = self.settings.max_resync_attempts.max(1);

        for attempt in 1..=max_attempts {
            telemetry::SNAPSHOT_FETCHES.inc();

            let snapshot = {
                let fetch = self.source.fetch();
                tokio::pin!(fetch);
                loop {
                    tokio::select! {
                        snapshot = &mut fetch => break snapshot?,
                        frame = self.client.recv() => {
                            if let Some(text) = frame? {
                                ingest(&mut self.reconciler, &self.settings.symbol, &text);
                            }
                        }
                    }
                }
            };

            match self.reconciler.on_snapshot(&snapshot) {
                Ok(replayed) => {
                    info!(
                        symbol = %self.settings.symbol,
                        snapshot_id = snapshot.last_update_id,
                        replayed,
                        last_update_id = self.reconciler.book().last_update_id(),
                        "Order book synchronised"
                    );
                    return Ok(());
                }
                Err(e) => {
                    telemetry::RESYNCS.inc();
                    warn!(
                        symbol = %self.settings.symbol,
                        attempt,
                        buffered = self.reconciler.buffered(),
                        overflows = self.reconciler.buffer_overflows(),
                        error = %e,
                        "Snapshot does not line up with buffered diffs, re-fetching"
                    );
                }
            }
        }

        Err(SyncError::ResyncExhausted(max_attempts))
    }

    /// Apply diffs as they arrive; returns `Ok` when a gap requires a resync
    async fn stream_live(&mut self) -> Result<()> {
        let mut missed = 0;

        loop {
            let frame = match timeout(self.settings.recv_timeout, self.client.recv()).await {
                Ok(frame) => {
                    missed = 0;
                    frame?
                }
                Err(_) => {
                    missed += 1;
                    if missed >= MAX_MISSED_RECV {
                        return Err(SyncError::ConnectionTimeout);
                    }
                    warn!("No message received within timeout, sending keepalive");
                    self.client
                        .ping()
                        .await
                        .map_err(|_| SyncError::ConnectionTimeout)?;
                    continue;
                }
            };

            let Some(text) = frame else { continue };

            match ingest(&mut self.reconciler, &self.settings.symbol, &text) {
                Some(DiffOutcome::Applied) => {
                    telemetry::DIFFS_APPLIED.inc();
                    self.publish();
                }
                Some(DiffOutcome::Stale) => telemetry::DIFFS_STALE.inc(),
                Some(DiffOutcome::Gap { expected, got }) => {
                    warn!(
                        symbol = %self.settings.symbol,
                        expected,
                        got,
                        "Sequence gap in depth stream, resynchronising"
                    );
                    telemetry::RESYNCS.inc();
                    return Ok(());
                }
                Some(DiffOutcome::Buffered) | None => {}
            }
        }
    }

    fn publish(&self) {
        let state = Arc::new(self.reconciler.state());
        trace!(last_update_id = state.last_update_id, "Book state published");
        self.book_tx.send_replace(Some(state));
    }
}

/// Parse one frame and feed it to the reconciler; malformed frames are dropped
fn ingest(reconciler: &mut OrderBookReconciler, symbol: &str, raw: &str) -> Option<DiffOutcome> {
    match ParsedMessage::parse(raw) {
        Ok(ParsedMessage::DepthUpdate(update)) => {
            if !update.symbol.is_empty() && !update.symbol.eq_ignore_ascii_case(symbol) {
                debug!(symbol = %update.symbol, "Ignoring depth update for another symbol");
                return None;
            }
            Some(reconciler.on_diff(update))
        }
        Ok(ParsedMessage::Unknown(msg)) => {
            trace!(msg = %msg, "Unknown message type");
            None
        }
        Err(e) => {
            telemetry::MALFORMED_MESSAGES
                .with_label_values(&[BOOK_COMPONENT])
                .inc();
            warn!(error = %e, "Dropping malformed depth message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::SyncPhase;

    #[test]
    fn test_stream_url() {
        let settings = BookStreamSettings {
            symbol: "BTCUSDT".to_string(),
            ws_endpoint: "wss://stream.binance.com:9443/".to_string(),
            ..BookStreamSettings::from_config(&Config::default())
        };
        assert_eq!(
            settings.stream_url(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@depth@100ms"
        );
    }

    #[test]
    fn test_ingest_drops_malformed_and_foreign_messages() {
        let mut reconciler = OrderBookReconciler::new("BTCUSDT", 10, 10);

        assert_eq!(ingest(&mut reconciler, "BTCUSDT", "{not json"), None);
        assert_eq!(
            ingest(
                &mut reconciler,
                "BTCUSDT",
                r#"{"e":"depthUpdate","s":"ETHUSDT","U":1,"u":2,"b":[],"a":[]}"#
            ),
            None
        );
        assert_eq!(
            ingest(
                &mut reconciler,
                "BTCUSDT",
                r#"{"e":"depthUpdate","s":"btcusdt","U":1,"u":2,"b":[],"a":[]}"#
            ),
            Some(DiffOutcome::Buffered)
        );
        assert_eq!(reconciler.buffered(), 1);
        assert_eq!(reconciler.phase(), SyncPhase::AwaitingSnapshot);
    }
}
