//! Quality monitor (C4, spec §4.3).
//!
//! Pure function over an ordered bar sequence; no I/O. The rolling
//! z-score / Welford variance machinery is grounded in the signal quality
//! gate's `RollingStats` (teacher: `signals/quality.rs`), generalized here
//! from a single online pass (streamed signals) to a full windowed pass
//! (bounded bar sequence) since C4 runs once per query rather than once per
//! event.

use crate::bar::Bar;
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityIssue {
    pub dimension: &'static str,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub timeliness: f64,
    pub anomaly_count: usize,
    pub invalid_ohlc_count: usize,
    pub total_records: usize,
    pub missing_records: usize,
    pub overall_score: f64,
    pub issues: Vec<QualityIssue>,
}

pub struct QualityMonitorConfig {
    pub price_sanity_ceiling: f64,
    pub zscore_threshold: f64,
    pub volume_spike_k: f64,
    pub rolling_window: usize,
}

impl Default for QualityMonitorConfig {
    fn default() -> Self {
        Self {
            price_sanity_ceiling: 10_000.0,
            zscore_threshold: 3.0,
            volume_spike_k: 5.0,
            rolling_window: 30,
        }
    }
}

#[derive(Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

/// Runs all five check families (spec §4.3) over `bars`, which must already
/// be sorted ascending by timestamp for a single `(symbol, period)`.
pub fn assess(
    bars: &[Bar],
    cadence_secs: Option<i64>,
    config: &QualityMonitorConfig,
) -> QualityReport {
    let total_records = bars.len();
    let mut issues = Vec::new();

    // --- Completeness: null counts + gap count vs expected cadence.
    let mut missing_records = 0usize;
    if let (Some(cadence), true) = (cadence_secs, bars.len() >= 2) {
        for w in bars.windows(2) {
            let gap = (w[1].timestamp - w[0].timestamp).num_seconds();
            if gap > cadence {
                let skipped = (gap / cadence).saturating_sub(1) as usize;
                missing_records += skipped;
            }
        }
    }
    let expected = total_records + missing_records;
    let completeness = if expected == 0 {
        1.0
    } else {
        1.0 - missing_records as f64 / expected as f64
    };
    if missing_records > 0 {
        let severity = if completeness < 0.8 {
            IssueSeverity::High
        } else {
            IssueSeverity::Medium
        };
        issues.push(QualityIssue {
            dimension: "completeness",
            severity,
            message: format!("{missing_records} missing bar(s) detected via cadence gaps"),
        });
    }

    // --- Accuracy: negative prices/volumes, price sanity ceiling.
    let mut accuracy_violations = 0usize;
    for b in bars {
        let negative = b.open.0 < 0 || b.high.0 < 0 || b.low.0 < 0 || b.close.0 < 0;
        let too_high = b.close.as_f64() > config.price_sanity_ceiling;
        if negative {
            accuracy_violations += 1;
            issues.push(QualityIssue {
                dimension: "accuracy",
                severity: IssueSeverity::Critical,
                message: format!("negative price at {}", b.timestamp),
            });
        }
        if too_high {
            accuracy_violations += 1;
            issues.push(QualityIssue {
                dimension: "accuracy",
                severity: IssueSeverity::High,
                message: format!("close {} exceeds sanity ceiling at {}", b.close, b.timestamp),
            });
        }
    }
    let accuracy = if total_records == 0 {
        1.0
    } else {
        1.0 - accuracy_violations as f64 / total_records as f64
    };

    // --- Consistency: OHLC invariant violations, duplicate timestamps.
    let mut invalid_ohlc_count = 0usize;
    for b in bars {
        if !b.ohlc_valid() {
            invalid_ohlc_count += 1;
            issues.push(QualityIssue {
                dimension: "consistency",
                severity: IssueSeverity::High,
                message: format!("OHLC invariant broken at {}", b.timestamp),
            });
        }
    }
    let mut sorted_ts: Vec<_> = bars.iter().map(|b| b.timestamp).collect();
    sorted_ts.sort();
    let duplicate_count = sorted_ts.windows(2).filter(|w| w[0] == w[1]).count();
    if duplicate_count > 0 {
        issues.push(QualityIssue {
            dimension: "consistency",
            severity: IssueSeverity::Medium,
            message: format!("{duplicate_count} duplicate timestamp(s)"),
        });
    }
    let consistency = if total_records == 0 {
        1.0
    } else {
        1.0 - (invalid_ohlc_count + duplicate_count) as f64 / total_records as f64
    };

    // --- Validity: rolling z-score outliers on close, volume spikes.
    let mut anomaly_count = 0usize;
    let mut close_stats = Welford::default();
    let mut volume_stats = Welford::default();
    for (i, b) in bars.iter().enumerate() {
        let window_start = i.saturating_sub(config.rolling_window);
        if i > window_start {
            let std = close_stats.std_dev();
            if std > 0.0 {
                let z = (b.close.as_f64() - close_stats.mean) / std;
                if z.abs() > config.zscore_threshold {
                    anomaly_count += 1;
                    issues.push(QualityIssue {
                        dimension: "validity",
                        severity: IssueSeverity::Medium,
                        message: format!("close z-score {z:.2} at {}", b.timestamp),
                    });
                }
            }
            let vstd = volume_stats.std_dev();
            if vstd > 0.0 && b.volume as f64 > volume_stats.mean + config.volume_spike_k * vstd {
                anomaly_count += 1;
                issues.push(QualityIssue {
                    dimension: "validity",
                    severity: IssueSeverity::Low,
                    message: format!("volume spike at {}", b.timestamp),
                });
            }
        }
        close_stats.update(b.close.as_f64());
        volume_stats.update(b.volume as f64);
    }
    // --- Timeliness: freshness relative to now.
    let timeliness = match bars.last() {
        Some(b) => {
            let hours_since = (Utc::now() - b.timestamp).num_seconds() as f64 / 3600.0;
            (1.0 - hours_since / 24.0).max(0.0)
        }
        None => 0.0,
    };

    // --- Overall score (spec §4.3: average of four dims scaled to 0-100,
    // penalized per critical/high issue, clamped). Four dims are
    // completeness/accuracy/consistency/timeliness (spec §3's QualityReport
    // shape) — validity issues still feed `anomaly_count` and the issue
    // list, they just aren't a fifth averaged dimension.
    let average = (completeness + accuracy + consistency + timeliness) / 4.0;
    let critical_count = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::Critical)
        .count();
    let high_count = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::High)
        .count();
    let penalty = critical_count as f64 * 20.0 + high_count as f64 * 10.0;
    let overall_score = (average * 100.0 - penalty).clamp(0.0, 100.0);

    QualityReport {
        completeness,
        accuracy,
        consistency,
        timeliness,
        anomaly_count,
        invalid_ohlc_count,
        total_records,
        missing_records,
        overall_score,
        issues,
    }
}

/// Per-bar quality score used to decide whether normalized bars are
/// retained or depressed (spec §3, §9 open question: retained by default).
pub fn score_bar(bar: &Bar) -> f64 {
    if bar.ohlc_valid() {
        1.0
    } else {
        0.7
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::{Amount, Price};
    use chrono::{Duration, Utc};

    fn bar_at(ts: chrono::DateTime<Utc>, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            symbol: "TEST".into(),
            timestamp: ts,
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
    fn broken_ohlc_bar_flagged_high_severity() {
        let bars = vec![bar_at(Utc::now(), 10.0, 9.0, 8.0, 9.5)];
        let report = assess(&bars, Some(86_400), &QualityMonitorConfig::default());
        assert_eq!(report.invalid_ohlc_count, 1);
        assert!(report
            .issues
            .iter()
            .any(|i| i.dimension == "consistency" && i.severity == IssueSeverity::High));
    }

    #[test]
    fn score_monotonicity_one_critical_drops_at_least_20() {
        let clean = vec![bar_at(Utc::now(), 10.0, 10.5, 9.5, 10.2)];
        let clean_report = assess(&clean, None, &QualityMonitorConfig::default());

        let mut dirty = clean.clone();
        dirty.push(bar_at(Utc::now() + Duration::hours(1), -5.0, 10.5, 9.5, 10.2));
        let dirty_report = assess(&dirty, None, &QualityMonitorConfig::default());

        assert!(clean_report.overall_score - dirty_report.overall_score >= 20.0 - 1e-9);
    }
}
