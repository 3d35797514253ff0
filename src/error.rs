//! Error types for the synchronisation engines

use thiserror::Error;

/// Errors raised by the book stream, the subscription multiplexer and their plumbing
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Sequence gap: expected update id {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("Snapshot {snapshot_id} is stale: first buffered diff starts at {first_update_id}")]
    StaleSnapshot { snapshot_id: u64, first_update_id: u64 },

    #[error("Snapshot resync failed after {0} attempts")]
    ResyncExhausted(u32),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Max reconnection attempts exceeded ({0})")]
    MaxReconnectAttemptsExceeded(u32),

    #[error("Service closed")]
    Closed,
}

impl SyncError {
    /// Whether the error ends the current connection and enters the reconnect backoff
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            SyncError::ConfigError(_) | SyncError::MaxReconnectAttemptsExceeded(_) | SyncError::Closed
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::RestApiError(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::IpcError(err.to_string())
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::ConfigError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        SyncError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
