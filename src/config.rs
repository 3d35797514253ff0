//! Configuration module for the synchronisation service

use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::Result;
use crate::websocket::ReconnectPolicy;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instrument whose book is reconciled (e.g., "BTCUSDT")
    pub symbol: String,

    /// WebSocket endpoint for the depth diff stream
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots
    pub rest_endpoint: String,

    /// JSON-RPC WebSocket endpoint for the subscription multiplexer
    pub rpc_endpoint: Option<String>,

    /// Accounts to subscribe to through the multiplexer
    pub rpc_accounts: Vec<String>,

    /// IPC socket path for publishing book states
    pub ipc_socket_path: Option<String>,

    /// Order book depth levels to publish
    pub depth_levels: usize,

    /// Levels requested from the snapshot endpoint
    pub snapshot_limit: usize,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub handshake_timeout_ms: u64,

    /// Snapshot re-fetches allowed per synchronisation
    pub max_resync_attempts: u32,

    /// Upper bound on diffs held while waiting for a snapshot
    pub max_buffered_diffs: usize,

    /// Port of the health check server
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            symbol: env::var("SYMBOL")
                .map(|s| s.trim().to_uppercase())
                .unwrap_or(defaults.symbol),
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            rpc_endpoint: env::var("RPC_ENDPOINT").ok().filter(|s| !s.is_empty()),
            rpc_accounts: env::var("RPC_ACCOUNTS")
                .map(|s| {
                    s.split(',')
                        .map(|a| a.trim().to_string())
                        .filter(|a| !a.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            ipc_socket_path: env::var("IPC_SOCKET_PATH").ok().filter(|s| !s.is_empty()),
            depth_levels: parse_env("DEPTH_LEVELS", defaults.depth_levels),
            snapshot_limit: parse_env("SNAPSHOT_LIMIT", defaults.snapshot_limit),
            reconnect_delay_ms: parse_env("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_reconnect_delay_ms: parse_env(
                "MAX_RECONNECT_DELAY_MS",
                defaults.max_reconnect_delay_ms,
            ),
            max_reconnect_attempts: parse_env(
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            handshake_timeout_ms: parse_env("HANDSHAKE_TIMEOUT_MS", defaults.handshake_timeout_ms),
            max_resync_attempts: parse_env("MAX_RESYNC_ATTEMPTS", defaults.max_resync_attempts),
            max_buffered_diffs: parse_env("MAX_BUFFERED_DIFFS", defaults.max_buffered_diffs),
            health_port: parse_env("HEALTH_PORT", defaults.health_port),
        })
    }

    /// Load configuration from a TOML file, with `MARKET_SYNC_*` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let mut config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MARKET_SYNC"))
            .build()?
            .try_deserialize::<Config>()?;
        config.symbol = config.symbol.trim().to_uppercase();
        Ok(config)
    }

    /// Reconnect policy shared by the book stream and the multiplexer
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            max_attempts: self.max_reconnect_attempts,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            rpc_endpoint: None,
            rpc_accounts: Vec::new(),
            ipc_socket_path: None,
            depth_levels: 20,
            snapshot_limit: 1000,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 60_000,
            max_reconnect_attempts: 10,
            handshake_timeout_ms: 10_000,
            max_resync_attempts: 5,
            max_buffered_diffs: 10_000,
            health_port: 9090,
        }
    }
}
