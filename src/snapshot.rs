//! Snapshot fetching
//!
//! One-shot REST call returning a priced book plus its sequence id.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::parser::OrderBookSnapshot;

/// Source of order book snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<OrderBookSnapshot>;
}

/// Fetches depth snapshots from a Binance-style REST endpoint
#[derive(Debug, Clone)]
pub struct RestSnapshotFetcher {
    client: reqwest::Client,
    url: String,
}

impl RestSnapshotFetcher {
    pub fn new(rest_endpoint: &str, symbol: &str, limit: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url: snapshot_url(rest_endpoint, symbol, limit),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotFetcher {
    async fn fetch(&self) -> Result<OrderBookSnapshot> {
        info!(url = %self.url, "Fetching order book snapshot");

        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RestApiError(format!(
                "Snapshot request failed with status {}",
                status
            )));
        }

        let snapshot = response.json::<OrderBookSnapshot>().await?;
        debug!(
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Snapshot received"
        );
        Ok(snapshot)
    }
}

fn snapshot_url(rest_endpoint: &str, symbol: &str, limit: usize) -> String {
    format!(
        "{}/depth?symbol={}&limit={}",
        rest_endpoint.trim_end_matches('/'),
        symbol.to_uppercase(),
        limit
    )
}
