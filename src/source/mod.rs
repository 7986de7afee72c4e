//! Data-source adapter (C2, spec §4.1).
//!
//! `BarSource` is the injectable boundary to the upstream market-data SDK
//! (spec §1 "treated as an injectable `BarSource`"). The upstream native
//! library ("xtquant") and any HTTP mirror are both first-class
//! implementations, selected by configuration rather than by an
//! exception-handler fallback branch (spec §9 "Inline fallback to mock data
//! when import fails").
//!
//! Retry, timeout-budgeting and circuit-breaking are NOT implemented here;
//! they are imposed once, at the C8 query-engine entry point, by the C14
//! policy wrapper (spec §4.1 "Retry and breaker are imposed by C14, not
//! C2.").

pub mod mock;
pub mod native;

use crate::bar::Period;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

/// A single raw record as handed back by an upstream source before
/// normalization — a loose string-keyed map (spec §4.2 "Accepts a loose
/// record (table or map)").
pub type RawRecord = serde_json::Map<String, Value>;

#[async_trait]
pub trait BarSource: Send + Sync {
    /// Fetches raw records for `symbol`/`period` between `start` and `end`
    /// (day precision, inclusive) — spec §4.1.
    async fn fetch_bars(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRecord>, AppError>;

    /// Human-readable adapter name, used in telemetry and error records.
    fn name(&self) -> &'static str;
}

/// Formats a date the way the native xtquant-style library expects
/// (`YYYYMMDD`), honoring the source's native format on the caller's
/// behalf (spec §4.1).
pub fn format_native_date(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}
