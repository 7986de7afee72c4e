//! Real-time market data gateway — binary entry point.
//!
//! Mirrors the teacher's `main.rs` shape (`load_env` → `init_tracing` →
//! build state → bind → `axum::serve` with graceful shutdown) but against
//! this crate's own [`marketdata_gateway::app::AppState`] instead of the
//! teacher's arbitrage-bot state: one object built once, passed by
//! reference into every handler (spec §9 "no implicit process-wide
//! state").

use anyhow::{Context, Result};
use marketdata_gateway::app::AppState;
use marketdata_gateway::config::Config;
use marketdata_gateway::http::build_router;
use marketdata_gateway::ws::codec::{CompressionCache, OutboundFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::prelude::*;

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("marketdata_gateway={},tower_http=info", config.log_level).into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();
    init_tracing(&config);

    info!(
        host = %config.websocket_host,
        http_port = config.http_port,
        max_connections = config.max_connections,
        "starting marketdata gateway"
    );

    let shutdown_timeout = config.shutdown_timeout;
    let state = AppState::build(config);
    state.start();

    let addr: SocketAddr = format!("{}:{}", state.config.websocket_host, state.config.http_port)
        .parse()
        .context("invalid WEBSOCKET_HOST/HTTP_PORT")?;

    let router = build_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP + WebSocket surface listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state, shutdown_timeout))
        .await
        .context("server error")?;

    Ok(())
}

/// Waits for SIGINT/SIGTERM, then gives in-flight send queues a bounded
/// window to drain (spec §5 "stop accepting new connections → broadcast
/// `server_shutdown` → wait up to `shutdown_timeout` → force-close").
/// `axum::serve`'s graceful shutdown already stops accepting new
/// connections and lets in-flight requests finish; this future waits for
/// the stop signal, fans the shutdown notice out to every open
/// connection, then bounds the drain with a timeout so no client blocks
/// shutdown indefinitely.
async fn shutdown_signal(state: AppState, shutdown_timeout: std::time::Duration) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, broadcasting server_shutdown and draining send queues");

    let frame = OutboundFrame::ServerShutdown { reason: "server restarting" };
    let client_ids = state.ws.connections.client_ids();
    let compression = CompressionCache::new();
    if let Ok(encoded) = compression.encode(&frame) {
        state.ws.connections.broadcast(&client_ids, Arc::new(encoded.bytes));
    }

    tokio::time::sleep(shutdown_timeout).await;
}
