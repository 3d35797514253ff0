//! Subscription registry
//!
//! Maps local subscription ids to their request, their current server-side id
//! and their delivery channel. Server ids only live as long as one connection;
//! every request (re)sent gets a fresh request id.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::protocol::{unsubscribe_method, Notification, RpcMessage, RpcRequest};
use crate::telemetry;

/// Local handle of a logical subscription; stable across reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Entry {
    method: String,
    params: Value,
    server_id: Option<u64>,
    sink: mpsc::UnboundedSender<Notification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingRequest {
    Subscribe { id: SubscriptionId, method: String },
    Unsubscribe { server_id: u64 },
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionId, Entry>,
    by_server_id: HashMap<u64, SubscriptionId>,
    pending: HashMap<u64, PendingRequest>,
    next_request_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription; nothing is sent
    pub fn register(
        &mut self,
        id: SubscriptionId,
        method: &str,
        params: Value,
        sink: mpsc::UnboundedSender<Notification>,
    ) {
        self.entries.insert(
            id,
            Entry {
                method: method.to_string(),
                params,
                server_id: None,
                sink,
            },
        );
    }

    /// Build the subscribe request for a registered subscription
    pub fn subscribe_request(&mut self, id: SubscriptionId) -> Option<RpcRequest> {
        let (method, params) = {
            let entry = self.entries.get(&id)?;
            (entry.method.clone(), entry.params.clone())
        };
        let request_id = self.next_request_id();
        self.pending.insert(
            request_id,
            PendingRequest::Subscribe {
                id,
                method: method.clone(),
            },
        );
        Some(RpcRequest::new(request_id, &method, params))
    }

    /// Forget everything tied to the previous connection
    pub fn reset_connection(&mut self) {
        for entry in self.entries.values_mut() {
            entry.server_id = None;
        }
        self.by_server_id.clear();
        self.pending.clear();
    }

    /// Requests to send on a fresh connection: one per registered subscription
    pub fn resubscribe_all(&mut self) -> Vec<RpcRequest> {
        self.reset_connection();
        let ids: Vec<SubscriptionId> = self.entries.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.subscribe_request(id))
            .collect()
    }

    /// Remove a subscription locally
    ///
    /// Returns the unsubscribe request to send when connected and the server id
    /// is known. Unknown ids are a no-op.
    pub fn remove(&mut self, id: SubscriptionId, connected: bool) -> Option<RpcRequest> {
        let entry = self.entries.remove(&id)?;
        let server_id = entry.server_id?;
        self.by_server_id.remove(&server_id);
        if connected {
            Some(self.unsubscribe_request(&entry.method, server_id))
        } else {
            None
        }
    }

    /// Apply one inbound message; may yield a request to send in response
    pub fn route(&mut self, msg: RpcMessage) -> Option<RpcRequest> {
        match msg {
            RpcMessage::SubscriptionAck { id, subscription } => match self.pending.remove(&id) {
                Some(PendingRequest::Subscribe { id: local, method }) => {
                    match self.entries.get_mut(&local) {
                        Some(entry) => {
                            entry.server_id = Some(subscription);
                            self.by_server_id.insert(subscription, local);
                            debug!(local_id = %local, server_id = subscription, "Subscription confirmed");
                            None
                        }
                        None => {
                            debug!(
                                local_id = %local,
                                server_id = subscription,
                                "Ack for a removed subscription, unsubscribing"
                            );
                            Some(self.unsubscribe_request(&method, subscription))
                        }
                    }
                }
                Some(PendingRequest::Unsubscribe { server_id }) => {
                    debug!(server_id, "Unsubscribe acknowledged");
                    None
                }
                None => {
                    debug!(request_id = id, "Ack for unknown request");
                    None
                }
            },
            RpcMessage::Response { id, result } => {
                match self.pending.remove(&id) {
                    Some(PendingRequest::Unsubscribe { server_id }) => {
                        debug!(server_id, result = %result, "Unsubscribe acknowledged");
                    }
                    Some(PendingRequest::Subscribe { id: local, .. }) => {
                        warn!(local_id = %local, result = %result, "Subscribe response without a subscription id");
                    }
                    None => debug!(request_id = id, "Response for unknown request"),
                }
                None
            }
            RpcMessage::Notification { method, params } => {
                let Some(local) = self.by_server_id.get(&params.subscription).copied() else {
                    debug!(method = %method, server_id = params.subscription, "Notification for unknown subscription");
                    return None;
                };
                let delivered = self
                    .entries
                    .get(&local)
                    .map(|entry| entry.sink.send(params).is_ok())
                    .unwrap_or(false);
                if delivered {
                    telemetry::NOTIFICATIONS_ROUTED.inc();
                    trace!(local_id = %local, method = %method, "Notification delivered");
                    None
                } else {
                    debug!(local_id = %local, "Subscriber dropped, unsubscribing");
                    self.remove(local, true)
                }
            }
            RpcMessage::Error { id, error } => {
                let request = id.and_then(|id| self.pending.remove(&id));
                warn!(request_id = ?id, request = ?request, error = %error, "RPC error");
                None
            }
            RpcMessage::Unknown(value) => {
                trace!(msg = %value, "Unknown message type");
                None
            }
        }
    }

    fn unsubscribe_request(&mut self, subscribe_method: &str, server_id: u64) -> RpcRequest {
        let request_id = self.next_request_id();
        self.pending
            .insert(request_id, PendingRequest::Unsubscribe { server_id });
        RpcRequest::new(
            request_id,
            &unsubscribe_method(subscribe_method),
            json!([server_id]),
        )
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn server_id(&self, id: SubscriptionId) -> Option<u64> {
        self.entries.get(&id).and_then(|e| e.server_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}
