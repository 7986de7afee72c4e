//! Canonical bar record and period registry (C1, spec §3).
//!
//! Prices and amounts are carried as fixed-point integers internally
//! (price ×10⁴, amount ×10²) to avoid floating-point drift through the
//! cache/resample/validate pipeline (spec §9 "Decimal arithmetic on
//! prices"); they convert to `f64` only at the JSON boundary (`Serialize`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const PRICE_SCALE: i64 = 10_000;
const AMOUNT_SCALE: i64 = 100;

/// Fixed-point price, four fractional decimals, banker's-rounded at the
/// normalizer boundary (C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Price(pub i64);

impl Price {
    pub fn from_f64_banker_rounded(v: f64) -> Self {
        Price(banker_round(v * PRICE_SCALE as f64))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.as_f64())
    }
}

impl Serialize for Price {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = f64::deserialize(d)?;
        Ok(Price::from_f64_banker_rounded(v))
    }
}

/// Fixed-point monetary amount, two fractional decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Amount(pub i64);

impl Amount {
    pub fn from_f64_banker_rounded(v: f64) -> Self {
        Amount(banker_round(v * AMOUNT_SCALE as f64))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / AMOUNT_SCALE as f64
    }
}

impl Serialize for Amount {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = f64::deserialize(d)?;
        Ok(Amount::from_f64_banker_rounded(v))
    }
}

/// Round-half-to-even ("banker's rounding") on an already-scaled value.
fn banker_round(scaled: f64) -> i64 {
    let floor = scaled.floor();
    let diff = scaled - floor;
    let floor_i = floor as i64;
    if (diff - 0.5).abs() < f64::EPSILON {
        if floor_i % 2 == 0 {
            floor_i
        } else {
            floor_i + 1
        }
    } else {
        scaled.round() as i64
    }
}

/// The canonical OHLCV bar (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: u64,
    pub amount: Amount,
    pub quality_score: f64,
}

impl Bar {
    /// OHLC invariant check (spec §8, property 1):
    /// `low ≤ min(open,close) ≤ max(open,close) ≤ high`, prices > 0, volume ≥ 0.
    pub fn ohlc_valid(&self) -> bool {
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo
            && lo <= hi
            && hi <= self.high
            && self.open.is_positive()
            && self.high.is_positive()
            && self.low.is_positive()
            && self.close.is_positive()
    }

    /// Approximate in-memory footprint used by the cache's byte accounting
    /// (spec §4.5: "≈200 B per bar + overhead").
    pub const APPROX_SIZE_BYTES: usize = 200;
}

/// The closed set of supported periods (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    M1,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    D1,
    W1,
    Mo1,
}

impl Period {
    pub const ALL: [Period; 10] = [
        Period::M1,
        Period::M5,
        Period::M15,
        Period::M30,
        Period::H1,
        Period::H2,
        Period::H4,
        Period::D1,
        Period::W1,
        Period::Mo1,
    ];

    /// Parses the wire string, honoring the legacy aliases from spec §6.
    pub fn parse(s: &str) -> Option<Period> {
        match s {
            "1m" => Some(Period::M1),
            "5m" => Some(Period::M5),
            "15m" => Some(Period::M15),
            "30m" => Some(Period::M30),
            "1h" => Some(Period::H1),
            "2h" => Some(Period::H2),
            "4h" => Some(Period::H4),
            "1d" | "DAILY" => Some(Period::D1),
            "1w" | "WEEKLY" => Some(Period::W1),
            "1M" | "MONTHLY" => Some(Period::Mo1),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::M1 => "1m",
            Period::M5 => "5m",
            Period::M15 => "15m",
            Period::M30 => "30m",
            Period::H1 => "1h",
            Period::H2 => "2h",
            Period::H4 => "4h",
            Period::D1 => "1d",
            Period::W1 => "1w",
            Period::Mo1 => "1M",
        }
    }

    /// Cadence in seconds, or `None` for the calendar-month period whose
    /// cadence is a month-step rather than a fixed duration (spec §3, §9:
    /// "standardizes on calendar-month alignment").
    pub fn cadence_secs(self) -> Option<i64> {
        match self {
            Period::M1 => Some(60),
            Period::M5 => Some(5 * 60),
            Period::M15 => Some(15 * 60),
            Period::M30 => Some(30 * 60),
            Period::H1 => Some(3600),
            Period::H2 => Some(2 * 3600),
            Period::H4 => Some(4 * 3600),
            Period::D1 => Some(86_400),
            Period::W1 => Some(7 * 86_400),
            Period::Mo1 => None,
        }
    }

    /// Default cache TTL in seconds (spec §3).
    pub fn default_ttl_secs(self) -> u64 {
        match self {
            Period::M1 => 300,
            Period::M5 => 900,
            Period::M15 => 1_800,
            Period::M30 => 3_600,
            Period::H1 => 7_200,
            Period::H2 => 14_400, // shares the 4h bucket's cadence family
            Period::H4 => 14_400,
            Period::D1 => 86_400,
            Period::W1 => 604_800,
            Period::Mo1 => 2_592_000,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_roundtrips_through_wire_strings() {
        for p in Period::ALL {
            assert_eq!(Period::parse(p.as_str()), Some(p));
        }
        assert_eq!(Period::parse("DAILY"), Some(Period::D1));
        assert_eq!(Period::parse("HOURLY"), Some(Period::H1));
        assert_eq!(Period::parse("WEEKLY"), Some(Period::W1));
        assert_eq!(Period::parse("MONTHLY"), Some(Period::Mo1));
        assert_eq!(Period::parse("bogus"), None);
    }

    #[test]
    fn ttl_table_matches_spec() {
        assert_eq!(Period::M1.default_ttl_secs(), 300);
        assert_eq!(Period::D1.default_ttl_secs(), 86_400);
        assert_eq!(Period::Mo1.default_ttl_secs(), 2_592_000);
    }

    fn bar(o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            symbol: "600519.SH".into(),
            timestamp: Utc::now(),
            open: Price::from_f64_banker_rounded(o),
            high: Price::from_f64_banker_rounded(h),
            low: Price::from_f64_banker_rounded(l),
            close: Price::from_f64_banker_rounded(c),
            volume: 100,
            amount: Amount::from_f64_banker_rounded(1000.0),
            quality_score: 1.0,
        }
    }

    #[test]
    fn ohlc_valid_bar_passes() {
        assert!(bar(10.0, 11.0, 9.5, 10.5).ohlc_valid());
    }

    #[test]
    fn ohlc_broken_bar_fails() {
        // high below close: violates the invariant from spec scenario B
        assert!(!bar(10.0, 9.0, 8.0, 9.5).ohlc_valid());
    }

    #[test]
    fn fixed_point_roundtrip_is_exact_to_four_decimals() {
        let p = Price::from_f64_banker_rounded(123.4567);
        assert_eq!(p.0, 1_234_567);
        assert!((p.as_f64() - 123.4567).abs() < 1e-9);
    }
}
