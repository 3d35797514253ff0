//! Subscription multiplexer
//!
//! Runs many logical JSON-RPC subscriptions over one persistent socket with
//! automatic reconnect and resubscription.

mod protocol;
mod registry;
mod service;

pub use protocol::{unsubscribe_method, Notification, RpcMessage, RpcRequest};
pub use registry::{SubscriptionId, SubscriptionRegistry};
pub use service::{Multiplexer, MultiplexerSettings, Subscription};

use crate::config::Config;

impl MultiplexerSettings {
    /// Settings for the configured RPC endpoint, if any
    pub fn from_config(config: &Config) -> Option<Self> {
        config.rpc_endpoint.as_ref().map(|endpoint| Self {
            endpoint: endpoint.clone(),
            policy: config.reconnect_policy(),
        })
    }
}
