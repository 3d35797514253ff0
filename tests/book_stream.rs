//! End-to-end tests for the book stream against a local depth server

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use market_sync::{
    BookStreamSettings, ConnectionState, OrderBookSnapshot, OrderBookState, PriceLevel,
    Publisher, ReconnectPolicy, SnapshotSource, StreamConnection,
};
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

fn depth_frame(first: u64, last: u64, bid: (&str, &str)) -> String {
    json!({
        "stream": "btcusdt@depth@100ms",
        "data": {
            "e": "depthUpdate",
            "E": 1672531200000u64,
            "s": "BTCUSDT",
            "U": first,
            "u": last,
            "b": [[bid.0, bid.1]],
            "a": []
        }
    })
    .to_string()
}

fn snapshot(last_update_id: u64) -> OrderBookSnapshot {
    OrderBookSnapshot {
        last_update_id,
        bids: vec![
            PriceLevel::new(dec!(100), dec!(1)),
            PriceLevel::new(dec!(99), dec!(2)),
        ],
        asks: vec![PriceLevel::new(dec!(101), dec!(1))],
    }
}

/// Serves each accepted connection the same batches, pausing between them,
/// then keeps the socket open until the client goes away
async fn spawn_depth_server(batches: Vec<Vec<String>>, pause: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let batches = batches.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                for batch in batches {
                    for frame in batch {
                        if ws.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    sleep(pause).await;
                }
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    format!("ws://{}", addr)
}

/// Hands out snapshots in order, repeating the last one
#[derive(Clone)]
struct ScriptedSource {
    snapshots: Arc<Mutex<VecDeque<OrderBookSnapshot>>>,
    fetches: Arc<AtomicUsize>,
    delay: Duration,
}

impl ScriptedSource {
    fn new(snapshots: Vec<OrderBookSnapshot>, delay: Duration) -> Self {
        Self {
            snapshots: Arc::new(Mutex::new(snapshots.into())),
            fetches: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self) -> market_sync::Result<OrderBookSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        let mut snapshots = self.snapshots.lock().unwrap();
        let next = if snapshots.len() > 1 {
            snapshots.pop_front()
        } else {
            snapshots.front().cloned()
        };
        next.ok_or_else(|| market_sync::SyncError::RestApiError("no snapshot".to_string()))
    }
}

fn settings(ws_endpoint: &str) -> BookStreamSettings {
    BookStreamSettings {
        symbol: "BTCUSDT".to_string(),
        ws_endpoint: ws_endpoint.to_string(),
        depth_levels: 10,
        max_buffered_diffs: 1000,
        max_resync_attempts: 5,
        policy: ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: 3,
            handshake_timeout: Duration::from_secs(2),
        },
        recv_timeout: Duration::from_secs(5),
    }
}

async fn wait_for_update(
    book: &mut watch::Receiver<Option<Arc<OrderBookState>>>,
    last_update_id: u64,
) -> Arc<OrderBookState> {
    let reached = timeout(
        WAIT,
        book.wait_for(|state| {
            state
                .as_ref()
                .map_or(false, |s| s.last_update_id >= last_update_id)
        }),
    )
    .await;
    let state = tokio_test::assert_ok!(tokio_test::assert_ok!(reached));
    let latest: Option<Arc<OrderBookState>> = (*state).clone();
    latest.unwrap()
}

#[tokio::test]
async fn test_buffered_diffs_reconcile_with_snapshot() {
    let endpoint = spawn_depth_server(
        vec![vec![
            depth_frame(95, 100, ("98", "7")),
            depth_frame(101, 102, ("100", "3")),
            depth_frame(103, 105, ("99", "0")),
            depth_frame(106, 106, ("97", "4")),
        ]],
        Duration::from_millis(10),
    )
    .await;
    let source = ScriptedSource::new(vec![snapshot(100)], Duration::from_millis(200));

    let stream = StreamConnection::open(settings(&endpoint), source.clone());
    let state = wait_for_update(&mut stream.watch_book(), 106).await;

    assert_eq!(state.last_update_id, 106);
    let bids: Vec<_> = state.bids.iter().map(|l| (l.price, l.quantity)).collect();
    // 98 came from a diff the snapshot already contained
    assert_eq!(bids, vec![(dec!(100), dec!(3)), (dec!(97), dec!(4))]);
    assert_eq!(state.asks[0].price, dec!(101));
    assert_eq!(source.fetches(), 1);
    assert!(stream.is_connected());

    stream.close().await;
}

#[tokio::test]
async fn test_stale_snapshot_is_refetched() {
    let endpoint = spawn_depth_server(
        vec![vec![
            depth_frame(101, 102, ("100", "3")),
            depth_frame(103, 104, ("99", "5")),
        ]],
        Duration::from_millis(10),
    )
    .await;
    // The first snapshot predates the buffered diffs
    let source = ScriptedSource::new(
        vec![snapshot(50), snapshot(100)],
        Duration::from_millis(300),
    );

    let stream = StreamConnection::open(settings(&endpoint), source.clone());
    let state = wait_for_update(&mut stream.watch_book(), 104).await;

    assert_eq!(state.last_update_id, 104);
    assert_eq!(state.bids[0].quantity, dec!(3));
    assert_eq!(state.bids[1].quantity, dec!(5));
    assert_eq!(source.fetches(), 2);

    stream.close().await;
}

#[tokio::test]
async fn test_live_gap_triggers_resync() {
    let endpoint = spawn_depth_server(
        vec![
            vec![depth_frame(101, 102, ("100", "3"))],
            vec![depth_frame(110, 111, ("100", "9"))],
        ],
        Duration::from_millis(500),
    )
    .await;
    let source = ScriptedSource::new(
        vec![snapshot(100), snapshot(109)],
        Duration::from_millis(50),
    );

    let stream = StreamConnection::open(settings(&endpoint), source.clone());
    let state = wait_for_update(&mut stream.watch_book(), 111).await;

    assert_eq!(state.last_update_id, 111);
    assert_eq!(state.bids[0].quantity, dec!(9));
    assert_eq!(source.fetches(), 2);

    stream.close().await;
}

#[tokio::test]
async fn test_close_stops_publishing() {
    let endpoint = spawn_depth_server(
        vec![
            vec![depth_frame(101, 101, ("100", "3"))],
            vec![depth_frame(102, 102, ("100", "4"))],
        ],
        Duration::from_millis(300),
    )
    .await;
    let source = ScriptedSource::new(vec![snapshot(100)], Duration::from_millis(10));

    let stream = StreamConnection::open(settings(&endpoint), source);
    let mut book = stream.watch_book();
    let status = stream.watch_status();
    wait_for_update(&mut book, 101).await;

    stream.close().await;
    assert_eq!(*status.borrow(), ConnectionState::Disconnected);

    sleep(Duration::from_millis(500)).await;
    let last = book.borrow().clone().unwrap();
    assert_eq!(last.last_update_id, 101);
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = ScriptedSource::new(vec![snapshot(100)], Duration::ZERO);
    let stream = StreamConnection::open(settings(&format!("ws://{}", addr)), source.clone());

    let mut status = stream.watch_status();
    let failed = timeout(WAIT, status.wait_for(|s| s.is_failed())).await;
    tokio_test::assert_ok!(tokio_test::assert_ok!(failed));

    assert!(stream.book().is_none());
    assert_eq!(source.fetches(), 0);

    stream.close().await;
}

#[tokio::test]
async fn test_stalled_ipc_peer_does_not_freeze_book() {
    let frames: Vec<String> = (101..=3100u64)
        .map(|id| depth_frame(id, id, ("100", &(id % 50 + 1).to_string())))
        .collect();
    let endpoint = spawn_depth_server(vec![frames], Duration::from_millis(10)).await;
    let source = ScriptedSource::new(vec![snapshot(100)], Duration::from_millis(10));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let publisher = Arc::new(
        Publisher::with_write_timeout(path.to_str().unwrap(), Duration::from_millis(100)).await,
    );
    // accepted but never read
    let (_peer, _) = listener.accept().await.unwrap();

    let stream =
        StreamConnection::open_with_publisher(settings(&endpoint), source, Some(publisher));
    let state = wait_for_update(&mut stream.watch_book(), 3100).await;

    assert_eq!(state.last_update_id, 3100);
    assert_eq!(state.bids[0].quantity, dec!(1));
    assert!(stream.is_connected());

    tokio_test::assert_ok!(timeout(WAIT, stream.close()).await);
}

#[tokio::test]
async fn test_handshake_timeout_fails_after_max_attempts() {
    // accepts TCP connections but never answers the upgrade request
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    let mut settings = settings(&format!("ws://{}", addr));
    settings.policy.handshake_timeout = Duration::from_millis(100);
    let source = ScriptedSource::new(vec![snapshot(100)], Duration::ZERO);
    let stream = StreamConnection::open(settings, source.clone());

    let mut status = stream.watch_status();
    let failed = timeout(WAIT, status.wait_for(|s| s.is_failed())).await;
    let reason = match &*tokio_test::assert_ok!(tokio_test::assert_ok!(failed)) {
        ConnectionState::Failed(reason) => reason.clone(),
        other => panic!("Expected failed state, got {:?}", other),
    };

    assert!(reason.contains("(3)"), "unexpected reason: {}", reason);
    assert!(reason.contains("Connection timeout"), "unexpected reason: {}", reason);
    assert_eq!(accepts.load(Ordering::SeqCst), 3);
    assert_eq!(source.fetches(), 0);
    assert!(stream.book().is_none());

    stream.close().await;
}
