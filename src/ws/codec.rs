//! Message router & codec (C11, spec §4.11).
//!
//! Inbound dispatch mirrors the ping/pong JSON-envelope switch in the
//! teacher's `handle_socket` (`main.rs`: `json.get("type")...` against
//! `"ping"`, with a legacy plain-text `"ping"` fallback) generalized to the
//! full inbound command set this gateway accepts. The outbound gzip path
//! is new (no teacher file compresses WS frames); it's grounded on
//! `flate2`'s `GzEncoder` as used for response compression in
//! `nautechsystems-nautilus_trader`'s manifest pack entry.

use crate::bar::{Bar, Period};
use crate::error::{AppError, ErrorRecord};
use crate::quality::QualityReport;
use crate::ws::subscription::{DataType, SubscriptionKey};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;

/// Frames smaller than this are sent as plain JSON; above it they're
/// gzipped (spec §4.11 "compression threshold").
pub const COMPRESSION_THRESHOLD_BYTES: usize = 1024;

/// Inbound frames above this size are rejected with `ErrFrameTooLarge`
/// before they're even parsed (spec §4.10/§6 "Frames exceeding 1 MiB
/// rejected").
pub const MAX_MESSAGE_SIZE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub enum InboundMessage {
    Subscribe { key: SubscriptionKey },
    Unsubscribe { key: SubscriptionKey },
    UnsubscribeAll,
    GetSubscriptions,
    /// `heartbeat` (spec §4.10): distinct from `ping` — refreshes C13's
    /// last-seen and, when the client echoes its own send time back,
    /// lets the caller compute round-trip time.
    Heartbeat { client_time: Option<i64> },
    Ping { timestamp: i64 },
    GetStatus,
    /// `get_stats` (spec §4.10): snapshot of C10/C9/C15 counters, distinct
    /// from `get_status`'s bare connection/subscription counts.
    GetStats,
}

/// Parses a raw inbound text frame. Legacy bare `"ping"` text is accepted
/// alongside the structured `{"type": "...", "data": {...}, "timestamp":
/// ...}` envelope (spec §6, carried over from the teacher's legacy-ping
/// fallback). Structured frames must carry both mandatory fields `{type,
/// timestamp}` (spec §4.10); the legacy bare-ping form is exempt, matching
/// the teacher's own legacy fallback which never carried an envelope at
/// all.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, AppError> {
    if text.eq_ignore_ascii_case("ping") {
        return Ok(InboundMessage::Ping { timestamp: 0 });
    }

    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| AppError::SourceProtocol(format!("invalid JSON frame: {e}")))?;

    let msg_type = json
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::UnknownType("<missing type field>".to_string()))?;

    if json.get("timestamp").is_none() {
        return Err(AppError::Validation("frame missing mandatory field: timestamp".into()));
    }

    let data = json.get("data").cloned().unwrap_or(serde_json::Value::Null);

    match msg_type {
        "ping" => {
            let timestamp = data.get("timestamp").and_then(|t| t.as_i64()).unwrap_or(0);
            Ok(InboundMessage::Ping { timestamp })
        }
        "heartbeat" => {
            let client_time = data.get("client_time").and_then(|t| t.as_i64());
            Ok(InboundMessage::Heartbeat { client_time })
        }
        "subscribe" => Ok(InboundMessage::Subscribe { key: parse_key(&data)? }),
        "unsubscribe" => Ok(InboundMessage::Unsubscribe { key: parse_key(&data)? }),
        "unsubscribe_all" => Ok(InboundMessage::UnsubscribeAll),
        "get_subscriptions" => Ok(InboundMessage::GetSubscriptions),
        "get_status" => Ok(InboundMessage::GetStatus),
        "get_stats" => Ok(InboundMessage::GetStats),
        other => Err(AppError::UnknownType(other.to_string())),
    }
}

fn parse_key(data: &serde_json::Value) -> Result<SubscriptionKey, AppError> {
    let symbol = data
        .get("symbol")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Validation("subscribe: missing symbol".into()))?
        .to_string();
    let period = data
        .get("period")
        .and_then(|v| v.as_str())
        .and_then(Period::parse)
        .ok_or_else(|| AppError::Validation("subscribe: missing/invalid period".into()))?;
    let data_type = data
        .get("data_type")
        .and_then(|v| v.as_str())
        .and_then(DataType::parse)
        .unwrap_or(DataType::Kline);
    Ok(SubscriptionKey { symbol, period, data_type })
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Sent once, immediately after a connection is registered (spec §4.9
    /// "sends welcome frame"; payload per spec §6).
    Welcome {
        client_id: String,
        supported_data_types: Vec<&'static str>,
        heartbeat_interval_secs: u64,
        max_subscriptions: usize,
    },
    Bar(Bar),
    Quality { symbol: String, report: QualityReport },
    Ping { server_time: i64 },
    Pong { timestamp: i64 },
    Error(ErrorRecord),
    Status { connections: usize, subscriptions: usize },
    /// `get_subscriptions` response (spec §4.10): the caller's own active
    /// subscriptions, not the whole registry.
    SubscriptionList { subscriptions: Vec<SubscriptionKey> },
    /// `get_stats` response (spec §4.10): a snapshot of C10/C9/C15
    /// counters, distinct from the coarser `status` frame.
    Stats { counters: serde_json::Value },
    /// Broadcast to every connection immediately before the graceful
    /// shutdown drain window starts (spec §5).
    ServerShutdown { reason: &'static str },
}

/// A compressed-or-not wire frame ready to push onto a client's outbound
/// channel.
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Caches the gzip output for identical JSON payloads within a publish
/// tick so fan-out to N subscribers of the same bar compresses once
/// (spec §4.11 "compression cache"), not N times.
#[derive(Default)]
pub struct CompressionCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl CompressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&self, frame: &OutboundFrame) -> Result<EncodedFrame, AppError> {
        let json = serde_json::to_string(frame)
            .map_err(|e| AppError::System(format!("encode outbound frame: {e}")))?;
        self.encode_json(json)
    }

    /// Encodes an operator-authored `{type, data}` body from `POST
    /// /ws/broadcast` (spec §6), which carries an arbitrary type name the
    /// fixed [`OutboundFrame`] enum can't tag. Shares the same
    /// size-threshold/gzip/per-tick cache path as [`Self::encode`].
    pub fn encode_raw(&self, kind: &str, data: serde_json::Value) -> Result<EncodedFrame, AppError> {
        let json = serde_json::to_string(&serde_json::json!({ "type": kind, "data": data }))
            .map_err(|e| AppError::System(format!("encode outbound frame: {e}")))?;
        self.encode_json(json)
    }

    fn encode_json(&self, json: String) -> Result<EncodedFrame, AppError> {
        if json.len() < COMPRESSION_THRESHOLD_BYTES {
            return Ok(EncodedFrame { bytes: json.into_bytes(), compressed: false });
        }

        if let Some(cached) = self.entries.lock().get(&json) {
            return Ok(EncodedFrame { bytes: cached.clone(), compressed: true });
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(json.as_bytes())
            .map_err(|e| AppError::System(format!("gzip encode: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| AppError::System(format!("gzip finish: {e}")))?;

        self.entries.lock().insert(json, compressed.clone());
        Ok(EncodedFrame { bytes: compressed, compressed: true })
    }

    /// Called once per publish tick to bound memory (spec §4.11: cache is
    /// scoped to a single tick, not long-lived).
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_plain_ping_parses() {
        let msg = parse_inbound("ping").unwrap();
        assert!(matches!(msg, InboundMessage::Ping { .. }));
    }

    #[test]
    fn structured_subscribe_parses() {
        let text =
            r#"{"type":"subscribe","timestamp":1,"data":{"symbol":"600519.SH","period":"1d"}}"#;
        let msg = parse_inbound(text).unwrap();
        match msg {
            InboundMessage::Subscribe { key } => {
                assert_eq!(key.symbol, "600519.SH");
                assert_eq!(key.period, Period::D1);
            }
            _ => panic!("expected subscribe"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let text = r#"{"type":"bogus","timestamp":1}"#;
        let err = parse_inbound(text).unwrap_err();
        assert!(matches!(err, AppError::UnknownType(_)));
    }

    #[test]
    fn missing_timestamp_is_rejected() {
        let text = r#"{"type":"subscribe","data":{"symbol":"600519.SH","period":"1d"}}"#;
        let err = parse_inbound(text).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn heartbeat_with_client_time_parses() {
        let text = r#"{"type":"heartbeat","timestamp":1,"data":{"client_time":1000}}"#;
        let msg = parse_inbound(text).unwrap();
        match msg {
            InboundMessage::Heartbeat { client_time } => assert_eq!(client_time, Some(1000)),
            _ => panic!("expected heartbeat"),
        }
    }

    #[test]
    fn small_frame_is_not_compressed() {
        let cache = CompressionCache::new();
        let frame = OutboundFrame::Pong { timestamp: 1 };
        let encoded = cache.encode(&frame).unwrap();
        assert!(!encoded.compressed);
    }

    #[test]
    fn large_frame_is_compressed_and_cached() {
        let cache = CompressionCache::new();
        let big_message = "y".repeat(COMPRESSION_THRESHOLD_BYTES + 10);
        let frame = OutboundFrame::Error(ErrorRecord::new(
            &AppError::System(big_message),
            crate::error::Severity::Low,
        ));
        let encoded = cache.encode(&frame).unwrap();
        assert!(encoded.compressed);
    }

    #[test]
    fn encode_raw_carries_operator_supplied_type() {
        let cache = CompressionCache::new();
        let encoded = cache.encode_raw("maintenance_notice", serde_json::json!({"minutes": 5})).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&encoded.bytes).unwrap();
        assert_eq!(parsed["type"], "maintenance_notice");
        assert_eq!(parsed["data"]["minutes"], 5);
    }
}
