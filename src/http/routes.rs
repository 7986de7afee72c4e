//! Historical-data HTTP handlers (spec §6 "HTTP surface") and the small
//! admin surface over the WS components. Response envelope follows spec §6
//! exactly: `{success, symbol, period, start_date, end_date, total_records,
//! data, quality_report?, metadata}` on success, `{success:false, message,
//! status}` on error.

use crate::app::AppState;
use crate::bar::{Bar, Period};
use crate::error::AppError;
use crate::quality::QualityReport;
use crate::ws::codec::OutboundFrame;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize)]
pub struct BarsEnvelope {
    pub success: bool,
    pub symbol: String,
    pub period: Period,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_records: usize,
    pub data: Vec<Bar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_report: Option<QualityReport>,
    pub metadata: serde_json::Value,
}

fn error_response(status: StatusCode, err: &AppError) -> Response {
    let body = json!({
        "success": false,
        "message": err.client_message(),
        "status": status.as_u16(),
    });
    (status, Json(body)).into_response()
}

fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Validation(_) | AppError::InvalidSymbol(_) => StatusCode::BAD_REQUEST,
        AppError::NoData => StatusCode::NOT_FOUND,
        AppError::CircuitOpen(_) | AppError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Timeout | AppError::SourceTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| AppError::Validation(format!("invalid date {s:?}, expected YYYY-MM-DD")))
}

fn parse_period_param(s: &str) -> Result<Period, AppError> {
    Period::parse(s).ok_or_else(|| AppError::Validation(format!("invalid period {s:?}")))
}

#[derive(Debug, Deserialize)]
pub struct HistoricalDataParams {
    pub symbol: String,
    pub start_date: String,
    pub end_date: String,
    pub period: String,
    #[serde(default)]
    pub include_quality_metrics: bool,
    #[serde(default)]
    pub normalize_data: bool,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    pub max_records: Option<usize>,
}

fn default_true() -> bool {
    true
}

/// GET `/historical-data` (spec §6).
pub async fn historical_data(
    State(state): State<AppState>,
    Query(params): Query<HistoricalDataParams>,
) -> Response {
    let _ = params.normalize_data; // normalization always runs (C3 is mandatory, not optional)
    let period = match parse_period_param(&params.period) {
        Ok(p) => p,
        Err(e) => return error_response(status_for(&e), &e),
    };
    let (start, end) = match (parse_date(&params.start_date), parse_date(&params.end_date)) {
        (Ok(s), Ok(e)) => (s, e),
        (Err(e), _) | (_, Err(e)) => return error_response(status_for(&e), &e),
    };

    let result = state
        .query_engine
        .get_bars_opts(&params.symbol, period, start, end, params.use_cache)
        .await;

    match result {
        Ok(mut resp) => {
            if let Some(max) = params.max_records {
                if resp.bars.len() > max {
                    resp.bars = resp.bars.split_off(resp.bars.len() - max);
                }
            }
            let envelope = BarsEnvelope {
                success: true,
                symbol: params.symbol,
                period,
                start_date: start,
                end_date: end,
                total_records: resp.bars.len(),
                data: resp.bars,
                quality_report: params.include_quality_metrics.then_some(resp.quality),
                metadata: json!({ "cached": resp.from_cache }),
            };
            Json(envelope).into_response()
        }
        Err(e) => error_response(status_for(&e), &e),
    }
}

#[derive(Debug, Deserialize)]
pub struct MultiPeriodParams {
    pub symbol: String,
    pub start_date: String,
    pub end_date: String,
    pub periods: String,
    #[serde(default)]
    pub include_quality_metrics: bool,
}

/// GET `/multi-period` (spec §6). A per-period source failure yields an
/// empty array for that period rather than failing the whole request
/// (spec §8 scenario C).
pub async fn multi_period(
    State(state): State<AppState>,
    Query(params): Query<MultiPeriodParams>,
) -> Response {
    let (start, end) = match (parse_date(&params.start_date), parse_date(&params.end_date)) {
        (Ok(s), Ok(e)) => (s, e),
        (Err(e), _) | (_, Err(e)) => return error_response(status_for(&e), &e),
    };

    let mut periods = Vec::new();
    for token in params.periods.split(',') {
        match parse_period_param(token.trim()) {
            Ok(p) => periods.push(p),
            Err(e) => return error_response(status_for(&e), &e),
        }
    }

    let results = state
        .query_engine
        .get_multi_period(&params.symbol, &periods, start, end)
        .await;

    let mut data = serde_json::Map::new();
    let mut quality = serde_json::Map::new();
    for (period, result) in results {
        match result {
            Ok(resp) => {
                data.insert(period.as_str().to_string(), json!(resp.bars));
                if params.include_quality_metrics {
                    quality.insert(period.as_str().to_string(), json!(resp.quality));
                }
            }
            Err(_) => {
                data.insert(period.as_str().to_string(), json!(Vec::<Bar>::new()));
            }
        }
    }

    let mut body = json!({
        "success": true,
        "symbol": params.symbol,
        "start_date": start,
        "end_date": end,
        "data": data,
    });
    if params.include_quality_metrics {
        body["quality_report"] = json!(quality);
    }
    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct QualityCheckParams {
    pub symbol: String,
    pub period: String,
    pub start_date: String,
    pub end_date: String,
}

/// GET `/quality-check` (spec §6): quality report only, no bar payload.
pub async fn quality_check(
    State(state): State<AppState>,
    Query(params): Query<QualityCheckParams>,
) -> Response {
    let period = match parse_period_param(&params.period) {
        Ok(p) => p,
        Err(e) => return error_response(status_for(&e), &e),
    };
    let (start, end) = match (parse_date(&params.start_date), parse_date(&params.end_date)) {
        (Ok(s), Ok(e)) => (s, e),
        (Err(e), _) | (_, Err(e)) => return error_response(status_for(&e), &e),
    };

    match state.query_engine.get_bars(&params.symbol, period, start, end).await {
        Ok(resp) => Json(json!({
            "success": true,
            "symbol": params.symbol,
            "period": period,
            "start_date": start,
            "end_date": end,
            "quality_report": resp.quality,
        }))
        .into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchDataParams {
    pub symbols: String,
    pub start_date: String,
    pub end_date: String,
    pub period: String,
}

/// GET `/batch-data` (spec §6): many symbols, one period, errors are
/// per-entry and never abort the batch (spec §4.7 `GetBatch`).
pub async fn batch_data(
    State(state): State<AppState>,
    Query(params): Query<BatchDataParams>,
) -> Response {
    let period = match parse_period_param(&params.period) {
        Ok(p) => p,
        Err(e) => return error_response(status_for(&e), &e),
    };
    let (start, end) = match (parse_date(&params.start_date), parse_date(&params.end_date)) {
        (Ok(s), Ok(e)) => (s, e),
        (Err(e), _) | (_, Err(e)) => return error_response(status_for(&e), &e),
    };

    let requests = params
        .symbols
        .split(',')
        .map(|s| (s.trim().to_string(), period, start, end))
        .collect();

    let results = state.query_engine.get_batch(requests).await;
    let mut data = serde_json::Map::new();
    for (symbol, result) in results {
        match result {
            Ok(resp) => {
                data.insert(
                    symbol,
                    json!({ "success": true, "total_records": resp.bars.len(), "data": resp.bars }),
                );
            }
            Err(e) => {
                data.insert(symbol, json!({ "success": false, "message": e.client_message() }));
            }
        }
    }

    Json(json!({
        "success": true,
        "period": period,
        "start_date": start,
        "end_date": end,
        "data": data,
    }))
    .into_response()
}

/// GET `/ws/status` (spec §6).
pub async fn ws_status(State(state): State<AppState>) -> Response {
    let (total_connects, total_disconnects, active) = state.ws.connections.stats();
    Json(json!({
        "connections_active": active,
        "total_connects": total_connects,
        "total_disconnects": total_disconnects,
        "subscriptions_active": state.ws.subscriptions.subscriber_count(),
    }))
    .into_response()
}

/// GET `/ws/connections` (spec §6).
pub async fn ws_connections(State(state): State<AppState>) -> Response {
    Json(json!({ "client_ids": state.ws.connections.client_ids() })).into_response()
}

/// GET `/ws/health` (spec §6, weighted health score per §4.14).
pub async fn ws_health(State(state): State<AppState>) -> Response {
    let cache_stats = state.cache.stats();
    Json(state.telemetry.health(&cache_stats)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct BroadcastBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

/// POST `/ws/broadcast` (spec §6): pushes an operator-authored `{type,
/// data}` frame to every currently connected client. `status` is handled
/// through the typed [`OutboundFrame::Status`] variant so it carries live
/// counters rather than whatever the caller passed; every other `type` is
/// forwarded verbatim as the arbitrary admin payload spec §6 describes.
pub async fn ws_broadcast(State(state): State<AppState>, Json(body): Json<BroadcastBody>) -> Response {
    let client_ids = state.ws.connections.client_ids();
    let compression = crate::ws::codec::CompressionCache::new();

    let result = if body.kind == "status" {
        let frame = OutboundFrame::Status {
            connections: state.ws.connections.connection_count(),
            subscriptions: state.ws.subscriptions.subscriber_count(),
        };
        crate::ws::broadcast_raw(&state.ws.connections, &compression, &client_ids, &frame)
    } else {
        crate::ws::broadcast_custom(
            &state.ws.connections,
            &compression,
            &client_ids,
            &body.kind,
            body.data,
        )
    };

    match result {
        Ok(delivered) => Json(json!({ "success": true, "delivered": delivered })).into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

/// POST `/ws/disconnect/{client_id}` (spec §6).
pub async fn ws_disconnect(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    let was_connected = state.ws.connections.is_connected(&client_id);
    state.ws.connections.disconnect(&client_id);
    state.ws.subscriptions.unsubscribe_all(&client_id);
    state.ws.heartbeat.forget(&client_id);
    Json(json!({ "success": true, "was_connected": was_connected })).into_response()
}

/// GET `/health` plain liveness probe, the ambient logging middleware's
/// noise-reduction path special-cases this exact route.
pub async fn health() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}
