//! WebSocket client
//!
//! Raw connection primitive shared by the book stream and the multiplexer.
//! Owns at most one socket; callers drive it from a single task.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    url: String,
}

impl WebSocketClient {
    /// Create a new, unconnected client
    pub fn new(url: &str) -> Self {
        Self {
            stream: None,
            url: url.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to the endpoint; the handshake is bounded by `handshake_timeout`
    pub async fn connect(&mut self, handshake_timeout: Duration) -> Result<()> {
        self.close().await;

        info!(url = %self.url, "Connecting WebSocket");

        let (ws_stream, response) = timeout(handshake_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SyncError::ConnectionTimeout)?
            .map_err(|e| SyncError::WebSocketConnection(format!("Failed to connect: {}", e)))?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);

        Ok(())
    }

    /// Receive the next data frame
    ///
    /// Returns `Ok(None)` for control frames; any error leaves the client disconnected.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::WebSocketConnection("Not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text message");
                Ok(Some(text))
            }
            Some(Ok(Message::Binary(data))) => Ok(Some(String::from_utf8_lossy(&data).to_string())),
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    warn!(error = %e, "Failed to answer ping");
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => Ok(None),
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(SyncError::WebSocketConnection(
                    "Connection closed".to_string(),
                ))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(SyncError::WebSocketMessage(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(SyncError::WebSocketConnection("Stream ended".to_string()))
            }
        }
    }

    /// Send a text frame
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::WebSocketConnection("Not connected".to_string()))?;

        if let Err(e) = stream.send(Message::Text(text)).await {
            self.stream = None;
            return Err(SyncError::WebSocketMessage(e.to_string()));
        }
        Ok(())
    }

    /// Send a ping to keep the connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send(Message::Ping(vec![]))
                .await
                .map_err(|e| SyncError::WebSocketMessage(e.to_string()))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection, sending a close frame when possible
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
