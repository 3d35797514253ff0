//! Parser module for depth stream messages and REST snapshots
//!
//! Accepts both Binance short keys (`U`, `u`, `b`, `a`) and the long field names
//! (`firstUpdateId`, `finalUpdateId`, `bidChanges`, `askChanges`).

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Incremental depth update (diff) message
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event type
    #[serde(rename = "e", alias = "eventType", default)]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E", alias = "eventTime", default)]
    pub event_time: u64,

    /// Symbol, empty when the stream does not name one
    #[serde(rename = "s", alias = "symbol", default)]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U", alias = "firstUpdateId")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u", alias = "finalUpdateId")]
    pub final_update_id: u64,

    /// Bid levels to change
    #[serde(rename = "b", alias = "bidChanges", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Ask levels to change
    #[serde(rename = "a", alias = "askChanges", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Price level (price, size pair) as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Order book snapshot from the REST API
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookSnapshot {
    /// Sequence id the snapshot represents
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    /// Bids
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Stream name
    pub stream: String,

    /// Data payload
    pub data: serde_json::Value,
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    DepthUpdate(DepthUpdate),
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    ///
    /// Messages that look like depth updates but fail to deserialize are errors;
    /// anything else (subscription acks, other streams) is `Unknown`.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        if let Ok(stream_msg) = serde_json::from_value::<StreamMessage>(value.clone()) {
            if stream_msg.stream.contains("depth") {
                let depth: DepthUpdate = serde_json::from_value(stream_msg.data)?;
                return Ok(ParsedMessage::DepthUpdate(depth));
            }
            return Ok(ParsedMessage::Unknown(stream_msg.data.to_string()));
        }

        if Self::looks_like_depth(&value) {
            let depth: DepthUpdate = serde_json::from_value(value)?;
            return Ok(ParsedMessage::DepthUpdate(depth));
        }

        Ok(ParsedMessage::Unknown(raw.to_string()))
    }

    fn looks_like_depth(value: &serde_json::Value) -> bool {
        match value.get("e").or_else(|| value.get("eventType")) {
            Some(event_type) => event_type == "depthUpdate",
            None => value.get("U").is_some() || value.get("firstUpdateId").is_some(),
        }
    }
}

/// Custom deserializer for price levels from array of string pairs
///
/// Rejects negative sizes; numbers are parsed as decimals, never compared as strings.
fn deserialize_price_levels<'de, D>(deserializer: D) -> Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            let price = Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?;
            let quantity = Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?;
            if price.is_sign_negative() || quantity.is_sign_negative() {
                return Err(serde::de::Error::custom("Negative price level"));
            }
            Ok(PriceLevel { price, quantity })
        })
        .collect()
}
