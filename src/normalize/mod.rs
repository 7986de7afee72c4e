//! Normalizer (C3, spec §4.2).
//!
//! Converts the loose, heterogeneous records returned by `BarSource` into
//! canonical `Bar`s. Column-name synonym resolution is an explicit static
//! table, not introspection (spec §9 "Dynamic field access ... replace with
//! a fixed, typed response schema"); the table itself is carried over from
//! the original `DataNormalizer.COLUMN_MAPPINGS` (see
//! `original_source/src/argus_mcp/processors/data_normalizer.py`).

use crate::bar::{Amount, Bar, Price};
use crate::error::AppError;
use crate::source::RawRecord;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;

/// Column-name synonyms recognized for each canonical field.
fn synonyms(field: &str) -> &'static [&'static str] {
    match field {
        "open" => &["open", "o", "OPEN", "opening_price"],
        "high" => &["high", "h", "HIGH", "highest_price"],
        "low" => &["low", "l", "LOW", "lowest_price"],
        "close" => &["close", "c", "CLOSE", "closing_price"],
        "volume" => &["volume", "vol", "v", "VOLUME", "VOL", "trade_volume"],
        "amount" => &["amount", "amt", "a", "AMOUNT", "AMT", "trade_amount", "turnover"],
        _ => &[],
    }
}

const REQUIRED_FIELDS: [&str; 5] = ["open", "high", "low", "close", "volume"];

fn lookup<'a>(record: &'a RawRecord, field: &str) -> Option<&'a Value> {
    synonyms(field).iter().find_map(|k| record.get(*k))
}

fn coerce_f64(field: &'static str, v: &Value) -> Result<f64, AppError> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| AppError::MalformedValue(format!("{field}: not a finite number"))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| AppError::MalformedValue(format!("{field}: {s:?} is not numeric"))),
        Value::Null => Err(AppError::MalformedValue(format!("{field}: null"))),
        other => Err(AppError::MalformedValue(format!(
            "{field}: unsupported type {other:?}"
        ))),
    }
}

/// Parses a timestamp field, applying `exchange_tz` if the value is naive
/// local time rather than already timezone-aware (spec §4.2).
fn coerce_timestamp(record: &RawRecord, exchange_tz: Tz) -> Result<DateTime<Utc>, AppError> {
    let raw = record
        .get("timestamp")
        .or_else(|| record.get("date"))
        .or_else(|| record.get("time"))
        .ok_or_else(|| AppError::MissingRequiredField(vec!["timestamp"]))?;

    let s = match raw {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            // Treat bare numbers as UTC unix seconds (or millis if large).
            let v = n
                .as_i64()
                .ok_or_else(|| AppError::MalformedValue("timestamp: not an integer".into()))?;
            let secs = if v > 10_000_000_000 { v / 1000 } else { v };
            return Ok(DateTime::<Utc>::from_timestamp(secs, 0)
                .ok_or_else(|| AppError::MalformedValue("timestamp: out of range".into()))?);
        }
        other => {
            return Err(AppError::MalformedValue(format!(
                "timestamp: unsupported type {other:?}"
            )))
        }
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // Naive local time: interpret in the configured exchange timezone, then
    // convert to UTC (spec §4.2, §9 "timestamps are UTC instants; period
    // alignment uses a configured exchange-local calendar only at boundary
    // computation, then converts back").
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y%m%d%H%M%S", "%Y-%m-%d", "%Y%m%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, fmt) {
            return exchange_tz
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| AppError::MalformedValue(format!("timestamp {s:?}: ambiguous local time")));
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(&s, fmt) {
            let naive = date.and_hms_opt(0, 0, 0).unwrap();
            return exchange_tz
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| AppError::MalformedValue(format!("timestamp {s:?}: ambiguous local time")));
        }
    }

    Err(AppError::MalformedValue(format!(
        "timestamp {s:?}: unrecognized format"
    )))
}

pub struct Normalizer {
    pub exchange_tz: Tz,
    /// Drop bars that fail the OHLC invariant outright instead of retaining
    /// them with a depressed quality score (spec §9, open-question policy
    /// choice exposed as config).
    pub drop_invalid_ohlc: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            exchange_tz: chrono_tz::Asia::Shanghai,
            drop_invalid_ohlc: false,
        }
    }
}

impl Normalizer {
    pub fn normalize(&self, symbol: &str, records: Vec<RawRecord>) -> Result<Vec<Bar>, AppError> {
        let mut missing: Vec<&'static str> = Vec::new();
        for field in REQUIRED_FIELDS {
            // Only report as globally missing if EVERY record lacks it;
            // individual records are checked again below.
            if records.iter().all(|r| lookup(r, field).is_none()) && !records.is_empty() {
                missing.push(field);
            }
        }
        if !missing.is_empty() {
            return Err(AppError::MissingRequiredField(missing));
        }

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            match self.normalize_one(symbol, &record) {
                Ok(bar) => out.push(bar),
                Err(AppError::Validation(_)) if self.drop_invalid_ohlc => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn normalize_one(&self, symbol: &str, record: &RawRecord) -> Result<Bar, AppError> {
        let mut missing = Vec::new();
        for field in REQUIRED_FIELDS {
            if lookup(record, field).is_none() {
                missing.push(match field {
                    "open" => "open",
                    "high" => "high",
                    "low" => "low",
                    "close" => "close",
                    "volume" => "volume",
                    _ => unreachable!(),
                });
            }
        }
        if !missing.is_empty() {
            return Err(AppError::MissingRequiredField(missing));
        }

        let open = coerce_f64("open", lookup(record, "open").unwrap())?;
        let high = coerce_f64("high", lookup(record, "high").unwrap())?;
        let low = coerce_f64("low", lookup(record, "low").unwrap())?;
        let close = coerce_f64("close", lookup(record, "close").unwrap())?;
        let volume_raw = coerce_f64("volume", lookup(record, "volume").unwrap())?;
        let volume = if volume_raw.is_nan() || volume_raw < 0.0 {
            0
        } else {
            volume_raw as u64
        };
        let amount = match lookup(record, "amount") {
            Some(v) => coerce_f64("amount", v)?,
            None => 0.0,
        };

        let timestamp = coerce_timestamp(record, self.exchange_tz)?;

        let mut bar = Bar {
            symbol: symbol.to_string(),
            timestamp,
            open: Price::from_f64_banker_rounded(open),
            high: Price::from_f64_banker_rounded(high),
            low: Price::from_f64_banker_rounded(low),
            close: Price::from_f64_banker_rounded(close),
            volume,
            amount: Amount::from_f64_banker_rounded(amount),
            quality_score: 1.0,
        };

        if !bar.ohlc_valid() {
            if self.drop_invalid_ohlc {
                return Err(AppError::Validation(format!(
                    "bar at {} fails OHLC invariant",
                    bar.timestamp
                )));
            }
            bar.quality_score = crate::quality::score_bar(&bar);
        }

        Ok(bar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(open: f64, high: f64, low: f64, close: f64, vol: f64) -> RawRecord {
        json!({
            "OPEN": open, "HIGH": high, "LOW": low, "CLOSE": close, "VOL": vol,
            "timestamp": "2023-12-01T00:00:00Z",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn recognizes_uppercase_synonyms() {
        let n = Normalizer::default();
        let bars = n.normalize("600519.SH", vec![rec(10.0, 11.0, 9.0, 10.5, 100.0)]).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open.as_f64(), 10.0);
        assert_eq!(bars[0].volume, 100);
    }

    #[test]
    fn missing_amount_defaults_to_zero() {
        let n = Normalizer::default();
        let bars = n.normalize("600519.SH", vec![rec(10.0, 11.0, 9.0, 10.5, 100.0)]).unwrap();
        assert_eq!(bars[0].amount.as_f64(), 0.0);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let n = Normalizer::default();
        let mut bad = rec(10.0, 11.0, 9.0, 10.5, 100.0);
        bad.remove("CLOSE");
        let err = n.normalize("600519.SH", vec![bad]).unwrap_err();
        assert!(matches!(err, AppError::MissingRequiredField(_)));
    }

    #[test]
    fn nan_volume_coerces_to_zero() {
        let n = Normalizer::default();
        let mut r = rec(10.0, 11.0, 9.0, 10.5, 100.0);
        r.insert("VOL".into(), json!("not-a-number"));
        let err = n.normalize("600519.SH", vec![r]).unwrap_err();
        assert!(matches!(err, AppError::MalformedValue(_)));
    }

    proptest::proptest! {
        /// Spec §8 property 1 ("OHLC invariant holds for all inputs"):
        /// any record whose low/high already bracket open/close normalizes
        /// to a bar with `quality_score == 1.0` and `ohlc_valid()`, no
        /// matter the magnitude of the inputs.
        #[test]
        fn bracketed_ohlc_always_normalizes_clean(
            open in 0.01f64..10_000.0,
            close in 0.01f64..10_000.0,
            spread in 0.0f64..100.0,
            vol in 0.0f64..1_000_000.0,
        ) {
            let lo = open.min(close) - spread;
            let hi = open.max(close) + spread;
            if lo <= 0.0 {
                return Ok(());
            }
            let n = Normalizer::default();
            let bars = n.normalize("600519.SH", vec![rec(open, hi, lo, close, vol)]).unwrap();
            prop_assert_eq!(bars.len(), 1);
            prop_assert!(bars[0].ohlc_valid());
            prop_assert_eq!(bars[0].quality_score, 1.0);
        }
    }
}
