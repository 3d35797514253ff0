//! Market Sync - service binary
//!
//! Reconciles the configured symbol's order book, optionally multiplexes account
//! subscriptions over a JSON-RPC socket, and serves health, book and metrics
//! endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_sync::{
    telemetry, AppState, BookStreamSettings, Config, ConnectionState, Multiplexer,
    MultiplexerSettings, OrderBookState, Publisher, RestSnapshotFetcher, StreamConnection,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Market Sync");

    let config = Arc::new(match std::env::var("CONFIG_FILE") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load()?,
    });
    info!(symbol = %config.symbol, depth = config.depth_levels, "Configuration loaded");

    let publisher = match &config.ipc_socket_path {
        Some(path) => Some(Arc::new(Publisher::new(path).await)),
        None => None,
    };

    let fetcher =
        RestSnapshotFetcher::new(&config.rest_endpoint, &config.symbol, config.snapshot_limit)?;
    info!(url = %fetcher.url(), "Snapshot source configured");
    let book_stream = StreamConnection::open_with_publisher(
        BookStreamSettings::from_config(&config),
        fetcher,
        publisher,
    );

    let multiplexer = MultiplexerSettings::from_config(&config).map(Multiplexer::open);
    if let Some(mux) = &multiplexer {
        subscribe_accounts(mux, &config.rpc_accounts)?;
    }

    let mut book_status = book_stream.watch_status();
    let state = Arc::new(AppState {
        book_stream,
        multiplexer,
        config: config.clone(),
    });

    let health_state = state.clone();
    let health_server = tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
            Ok(())
        }
        reason = wait_for_failure(&mut book_status) => {
            error!(reason = %reason, "Book stream gave up");
            Err(anyhow::anyhow!("book stream failed: {}", reason))
        }
    };

    health_server.abort();
    let _ = health_server.await;

    match Arc::try_unwrap(state) {
        Ok(state) => {
            state.book_stream.close().await;
            if let Some(mux) = state.multiplexer {
                mux.close().await;
            }
        }
        Err(_) => warn!("Application state still shared, dropping without graceful close"),
    }

    info!("Market Sync stopped");
    outcome
}

/// Subscribe to account changes and log each notification
fn subscribe_accounts(mux: &Multiplexer, accounts: &[String]) -> anyhow::Result<()> {
    for account in accounts {
        let mut subscription = mux.subscribe(
            "accountSubscribe",
            json!([account, {"encoding": "base64", "commitment": "confirmed"}]),
        )?;
        let account = account.clone();
        tokio::spawn(async move {
            while let Some(notification) = subscription.recv().await {
                info!(
                    account = %account,
                    slot = ?notification.result["context"]["slot"].as_u64(),
                    "Account changed"
                );
            }
        });
    }
    Ok(())
}

/// Resolves with the failure reason once the status turns `Failed`
async fn wait_for_failure(status: &mut watch::Receiver<ConnectionState>) -> String {
    loop {
        if let ConnectionState::Failed(reason) = &*status.borrow() {
            return reason.clone();
        }
        if status.changed().await.is_err() {
            // Sender gone without failing: wait for the shutdown signal instead
            std::future::pending::<()>().await;
        }
    }
}

/// Start HTTP server for health checks, the current book and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/book", get(current_book))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let book = state.book_stream.book();
    let book_status = state.book_stream.status();
    let healthy = book_status.is_connected()
        && book.as_ref().map_or(false, |b| b.metrics.is_healthy());

    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "component": "market-sync",
        "symbol": state.config.symbol,
        "book_stream": book_status,
        "last_update_id": book.as_ref().map(|b| b.last_update_id),
        "multiplexer": state.multiplexer.as_ref().map(|m| m.status()),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn current_book(
    State(state): State<Arc<AppState>>,
) -> Result<Json<OrderBookState>, StatusCode> {
    state
        .book_stream
        .book()
        .map(|book| Json(book.as_ref().clone()))
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn metrics() -> String {
    telemetry::render()
}
