//! Prometheus counters for the synchronisation engines
//!
//! Registered in the default registry on first use.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts};
use tracing::warn;

pub const BOOK_COMPONENT: &str = "book_stream";
pub const RPC_COMPONENT: &str = "multiplexer";

pub static DIFFS_APPLIED: Lazy<IntCounter> =
    Lazy::new(|| counter("market_sync_diffs_applied_total", "Depth diffs applied to the book"));

pub static DIFFS_STALE: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "market_sync_diffs_stale_total",
        "Depth diffs skipped because the book already contained them",
    )
});

pub static DIFFS_EVICTED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "market_sync_diffs_evicted_total",
        "Buffered depth diffs dropped because the diff buffer was full",
    )
});

pub static PUBLISH_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "market_sync_publish_timeouts_total",
        "IPC writes abandoned because the peer stopped reading",
    )
});

pub static SNAPSHOT_FETCHES: Lazy<IntCounter> =
    Lazy::new(|| counter("market_sync_snapshot_fetches_total", "REST snapshots fetched"));

pub static RESYNCS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "market_sync_resyncs_total",
        "Snapshot re-fetches caused by sequence discontinuities",
    )
});

pub static NOTIFICATIONS_ROUTED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "market_sync_notifications_routed_total",
        "Subscription notifications delivered to subscribers",
    )
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "market_sync_reconnects_total",
        "Failed connections that entered the reconnect backoff",
    )
});

pub static MALFORMED_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "market_sync_malformed_messages_total",
        "Inbound messages dropped because they could not be parsed",
    )
});

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("static metric definition");
    if let Err(e) = prometheus::register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Metric registration failed");
    }
    counter
}

fn counter_vec(name: &str, help: &str) -> IntCounterVec {
    let counter =
        IntCounterVec::new(Opts::new(name, help), &["component"]).expect("static metric definition");
    if let Err(e) = prometheus::register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Metric registration failed");
    }
    counter
}

/// Render the default registry in the text exposition format
pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
