//! JSON-RPC wire format for subscription sockets
//!
//! Requests: `{"jsonrpc":"2.0","id":N,"method":"...","params":[...]}`.
//! Inbound frames are acks (`{id, result}`), pushes
//! (`{method: "<x>Notification", params: {subscription, result}}`) or errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn to_text(&self) -> String {
        // Serializing a struct of strings, integers and a Value cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Push payload delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notification {
    /// Server-side subscription id
    pub subscription: u64,
    pub result: Value,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// Response whose result is a server subscription id
    SubscriptionAck { id: u64, subscription: u64 },
    /// Response with a non-numeric result (e.g. an unsubscribe ack)
    Response { id: u64, result: Value },
    Notification { method: String, params: Notification },
    Error { id: Option<u64>, error: Value },
    Unknown(Value),
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl RpcMessage {
    /// Classify one frame; only syntactically invalid JSON or a malformed
    /// notification is an error
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        let msg: RawMessage = serde_json::from_value(value.clone())?;

        if let Some(error) = msg.error {
            return Ok(RpcMessage::Error { id: msg.id, error });
        }

        if let Some(method) = msg.method {
            if method.ends_with("Notification") {
                let params: Notification =
                    serde_json::from_value(msg.params.unwrap_or(Value::Null))?;
                return Ok(RpcMessage::Notification { method, params });
            }
            return Ok(RpcMessage::Unknown(value));
        }

        match (msg.id, msg.result) {
            (Some(id), Some(result)) => match result.as_u64() {
                Some(subscription) => Ok(RpcMessage::SubscriptionAck { id, subscription }),
                None => Ok(RpcMessage::Response { id, result }),
            },
            _ => Ok(RpcMessage::Unknown(value)),
        }
    }
}

/// Unsubscribe method paired with a subscribe method
///
/// `accountSubscribe` becomes `accountUnsubscribe`; methods without the
/// `Subscribe` suffix get `Unsubscribe` appended.
pub fn unsubscribe_method(subscribe_method: &str) -> String {
    match subscribe_method.strip_suffix("Subscribe") {
        Some(stem) => format!("{}Unsubscribe", stem),
        None => format!("{}Unsubscribe", subscribe_method),
    }
}
