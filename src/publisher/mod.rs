//! IPC publisher
//!
//! Writes book states to a Unix socket as length-prefixed MessagePack frames.
//! The socket is optional downstream plumbing: a missing, broken or stalled
//! peer is logged and retried on the next publish, never surfaced to the stream.
//! The book stream hands states over through a watch channel, so a slow peer
//! only ever sees the latest book.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::orderbook::OrderBookState;
use crate::telemetry;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Publisher for sending book states via Unix socket
pub struct Publisher {
    socket_path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
    write_timeout: Duration,
}

impl Publisher {
    /// Create a publisher; the first connection is attempted immediately
    pub async fn new(socket_path: &str) -> Self {
        Self::with_write_timeout(socket_path, DEFAULT_WRITE_TIMEOUT).await
    }

    /// Like `new`, bounding every connect and frame write by `write_timeout`
    pub async fn with_write_timeout(socket_path: &str, write_timeout: Duration) -> Self {
        let publisher = Self {
            socket_path: PathBuf::from(socket_path),
            stream: Mutex::new(None),
            write_timeout,
        };

        let mut guard = publisher.stream.lock().await;
        match publisher.connect().await {
            Ok(stream) => *guard = Some(stream),
            Err(e) => warn!(error = %e, "Initial IPC connection failed, will retry on publish"),
        }
        drop(guard);

        publisher
    }

    async fn connect(&self) -> Result<UnixStream> {
        let stream = timeout(self.write_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| SyncError::IpcError("Connect timed out".to_string()))?
            .map_err(|e| {
                SyncError::IpcError(format!(
                    "Failed to connect to {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;
        info!(path = %self.socket_path.display(), "Connected to IPC socket");
        Ok(stream)
    }

    /// Publish one book state
    ///
    /// Serialisation failures are returned; socket failures and writes that
    /// outlast the write timeout only drop the connection so the next call
    /// reconnects.
    pub async fn publish(&self, state: &OrderBookState) -> Result<()> {
        let frame = encode_frame(state)?;

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            match self.connect().await {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    debug!(error = %e, "IPC peer unavailable, state not published");
                    return Ok(());
                }
            }
        }

        if let Some(stream) = guard.as_mut() {
            match timeout(self.write_timeout, stream.write_all(&frame)).await {
                Ok(Ok(())) => debug!(
                    symbol = %state.symbol,
                    update_id = state.last_update_id,
                    "Published order book state"
                ),
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
                Err(_) => {
                    // A partial frame may be on the wire; the connection is unusable
                    telemetry::PUBLISH_TIMEOUTS.inc();
                    warn!(
                        timeout_ms = self.write_timeout.as_millis() as u64,
                        "IPC peer stopped reading, dropping connection"
                    );
                    *guard = None;
                }
            }
        }

        Ok(())
    }

    /// Publish every book state seen on `states` until the sender is dropped
    ///
    /// States published while a write is in flight collapse into the latest one.
    pub async fn run(self: Arc<Self>, mut states: watch::Receiver<Option<Arc<OrderBookState>>>) {
        while states.changed().await.is_ok() {
            let latest = states.borrow_and_update().clone();
            if let Some(state) = latest {
                if let Err(e) = self.publish(&state).await {
                    warn!(error = %e, "Failed to publish book state");
                }
            }
        }
        debug!(path = %self.socket_path.display(), "Book channel closed, publisher stopped");
    }
}

/// MessagePack payload behind a 4-byte big-endian length prefix
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Bytes> {
    let payload = rmp_serde::to_vec_named(value)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| SyncError::SerializationError("Frame too large".to_string()))?;

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(len);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}
