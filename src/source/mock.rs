//! First-class mock `BarSource` (spec §9: "the mock source is a first-class
//! implementation, not an exception-handler branch"). Selected the same way
//! `native::NativeBarSource` would be — via configuration — never as an
//! `import`-failure fallback.

use super::{BarSource, RawRecord};
use crate::bar::Period;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Deterministic synthetic bar generator, seeded by symbol so repeated
/// fetches of the same range are stable (useful for cache-hit tests,
/// spec §8 property 2).
pub struct MockBarSource {
    /// Per-symbol base price, seeded deterministically from the symbol
    /// string so tests are reproducible without external RNG state.
    base_prices: parking_lot::Mutex<HashMap<String, f64>>,
    /// Symbols configured to return `ErrNoData` / `ErrSourceUnavailable`,
    /// used to exercise C14's circuit breaker and C8's per-entry error path
    /// (spec §8 scenario F, scenario C).
    failing_symbols: parking_lot::Mutex<HashMap<String, FailureMode>>,
    calls: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    Unavailable,
    NoData,
    AlwaysFail,
}

impl Default for MockBarSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBarSource {
    pub fn new() -> Self {
        Self {
            base_prices: parking_lot::Mutex::new(HashMap::new()),
            failing_symbols: parking_lot::Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_failure_mode(&self, symbol: &str, mode: FailureMode) {
        self.failing_symbols
            .lock()
            .insert(symbol.to_string(), mode);
    }

    pub fn clear_failure_mode(&self, symbol: &str) {
        self.failing_symbols.lock().remove(symbol);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn seeded_base_price(&self, symbol: &str) -> f64 {
        let mut guard = self.base_prices.lock();
        *guard.entry(symbol.to_string()).or_insert_with(|| {
            let hash: u64 = symbol.bytes().fold(7u64, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(b as u64)
            });
            10.0 + (hash % 9_000) as f64 / 100.0
        })
    }
}

#[async_trait]
impl BarSource for MockBarSource {
    async fn fetch_bars(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRecord>, AppError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(mode) = self.failing_symbols.lock().get(symbol).copied() {
            match mode {
                FailureMode::Unavailable | FailureMode::AlwaysFail => {
                    return Err(AppError::SourceUnavailable(format!(
                        "mock source configured to fail for {symbol}"
                    )));
                }
                FailureMode::NoData => return Err(AppError::NoData),
            }
        }

        if start > end {
            return Ok(Vec::new());
        }

        let cadence = period.cadence_secs().unwrap_or(30 * 86_400);
        let base = self.seeded_base_price(symbol);
        let mut records = Vec::new();

        let start_ts = start
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .unwrap()
            .and_utc()
            .timestamp();

        let mut ts = start_ts;
        let mut step = 0i64;
        while ts <= end_ts {
            // A gentle deterministic oscillation keeps OHLC valid and gives
            // the quality monitor (C4) something non-trivial to measure.
            let drift = (step as f64 * 0.37).sin() * 0.6;
            let open = base + drift;
            let close = open + (step as f64 * 0.53).cos() * 0.3;
            let high = open.max(close) + 0.15;
            let low = open.min(close) - 0.15;
            let volume = 1_000 + (step as u64 % 50) * 37;
            let amount = (open + close) / 2.0 * volume as f64;

            records.push(
                json!({
                    "symbol": symbol,
                    "timestamp": chrono::DateTime::<Utc>::from_timestamp(ts, 0)
                        .unwrap_or_else(Utc::now)
                        .to_rfc3339(),
                    "open": open,
                    "high": high,
                    "low": low,
                    "close": close,
                    "volume": volume,
                    "amount": amount,
                })
                .as_object()
                .cloned()
                .expect("object literal"),
            );

            ts += cadence;
            step += 1;
        }

        Ok(records)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_bars_for_a_date_range() {
        let src = MockBarSource::new();
        let start = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2023, 12, 5).unwrap();
        let records = src
            .fetch_bars("600519.SH", Period::D1, start, end)
            .await
            .unwrap();
        assert_eq!(records.len(), 5);
    }

    #[tokio::test]
    async fn respects_configured_failure_mode() {
        let src = MockBarSource::new();
        src.set_failure_mode("AAA.SH", FailureMode::Unavailable);
        let start = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2023, 12, 5).unwrap();
        let err = src
            .fetch_bars("AAA.SH", Period::D1, start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn same_range_is_deterministic() {
        let src = MockBarSource::new();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let a = src.fetch_bars("000001.SZ", Period::D1, start, end).await.unwrap();
        let b = src.fetch_bars("000001.SZ", Period::D1, start, end).await.unwrap();
        assert_eq!(a, b);
    }
}
