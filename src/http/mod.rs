//! HTTP surface (spec §6): historical-data query endpoints plus a small
//! admin surface over the WS gateway. Mirrors the teacher's `Router::new()`
//! + `.route(...)` assembly in `main.rs`, generalized from the
//! backtest/edge endpoint set to the historical-data/WS-admin set this
//! gateway exposes.

pub mod routes;

use crate::app::AppState;
use crate::middleware::logging::request_logging;
use crate::middleware::rate_limit::rate_limit_middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let rate_limiter = state.rate_limiter.clone();
    Router::new()
        .route("/health", get(routes::health))
        .route("/historical-data", get(routes::historical_data))
        .route("/multi-period", get(routes::multi_period))
        .route("/quality-check", get(routes::quality_check))
        .route("/batch-data", get(routes::batch_data))
        .route("/ws/status", get(routes::ws_status))
        .route("/ws/connections", get(routes::ws_connections))
        .route("/ws/health", get(routes::ws_health))
        .route("/ws/broadcast", post(routes::ws_broadcast))
        .route("/ws/disconnect/:client_id", post(routes::ws_disconnect))
        .route("/ws", get(crate::ws::websocket_handler))
        .route("/metrics", get(metrics))
        .layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn metrics(axum::extract::State(state): axum::extract::State<AppState>) -> String {
    let cache_stats = state.cache.stats();
    state.telemetry.to_prometheus(&cache_stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn health_route_returns_ok() {
        let state = AppState::build(Config::for_tests());
        let router = build_router(state);
        let response = axum_test_request(router, "/health").await;
        assert_eq!(response, 200);
    }

    async fn axum_test_request(router: Router, path: &str) -> u16 {
        use axum::extract::ConnectInfo;
        use std::net::SocketAddr;
        use tower::ServiceExt;
        let mut request = axum::http::Request::builder()
            .uri(path)
            .body(axum::body::Body::empty())
            .unwrap();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        let response = router.oneshot(request).await.unwrap();
        response.status().as_u16()
    }
}
