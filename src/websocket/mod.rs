//! WebSocket module: connection primitive, reconnect policy and the book stream

mod backoff;
mod client;
mod manager;

pub use backoff::ReconnectPolicy;
pub use client::WebSocketClient;
pub use manager::{BookStreamSettings, StreamConnection};

use serde::Serialize;

/// Connection status shared by the book stream and the subscription multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; terminal until the service is reopened
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}
