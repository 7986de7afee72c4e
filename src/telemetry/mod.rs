//! Telemetry core (C15, spec §4.15): counters, a 7-component weighted
//! health score, alert thresholds and a simple repeated-failure pattern
//! detector.
//!
//! The registry shape — atomic counters plus a `RwLock<HashMap<String,
//! LatencyHistogram>>` keyed by operation, exported through a hand-rolled
//! `to_prometheus()` text builder — mirrors
//! `route_quality/metrics.rs::RouteQualityMetrics`, generalized from
//! per-endpoint keys to per-operation keys. The per-check breakdown in
//! `health()` is grounded in the original's
//! `health_checker/*.py` family of checks, each returning its own
//! status/severity/message rather than folding straight into one number.

pub mod histogram;

use crate::cache::CacheStats;
use crate::error::Severity;
use crate::resilience::ErrorHandler;
use histogram::LatencyHistogram;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Total [`crate::error::ErrorCategory`] variants — the denominator for
/// "fraction of breaker categories currently open" in the connectivity
/// check.
const ERROR_CATEGORY_COUNT: f64 = 13.0;

const WEIGHT_HIT_RATE: f64 = 0.25;
const WEIGHT_MEMORY: f64 = 0.20;
const WEIGHT_RESPONSE: f64 = 0.20;
const WEIGHT_ERROR: f64 = 0.15;
const WEIGHT_EVICTION: f64 = 0.10;
const WEIGHT_CONNECTIVITY: f64 = 0.05;
const WEIGHT_MONITORING: f64 = 0.05;

const RESPONSE_EXCELLENT_US: u64 = 100_000;
const RESPONSE_GOOD_US: u64 = 300_000;
const RESPONSE_WARNING_US: u64 = 1_000_000;

/// Status bucket for one weighted health check (spec §4.14).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Excellent,
    Good,
    Warning,
    Critical,
    Unknown,
}

/// One weighted component of [`HealthReport::checks`] (spec §4.14): a
/// status/severity pair plus a human-readable message, the raw metrics it
/// was computed from, and any remediation hints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: CheckStatus,
    pub severity: Severity,
    pub message: String,
    pub metrics: serde_json::Value,
    pub recommendations: Vec<String>,
}

impl HealthCheck {
    fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Unknown,
            severity: Severity::Low,
            message: message.into(),
            metrics: json!({}),
            recommendations: Vec::new(),
        }
    }

    /// Buckets a 0-100 "goodness" score into a status/severity pair and
    /// attaches `recommendations` only when the result isn't excellent —
    /// matching the original's "recommendations are empty on a clean
    /// check" convention.
    fn from_score(
        score: f64,
        message: String,
        metrics: serde_json::Value,
        recommendations: Vec<&'static str>,
    ) -> Self {
        let (status, severity) = bucket(score);
        let recommendations = if status == CheckStatus::Excellent {
            Vec::new()
        } else {
            recommendations.into_iter().map(str::to_string).collect()
        };
        Self { status, severity, message, metrics, recommendations }
    }
}

fn bucket(score: f64) -> (CheckStatus, Severity) {
    if score >= 90.0 {
        (CheckStatus::Excellent, Severity::Low)
    } else if score >= 75.0 {
        (CheckStatus::Good, Severity::Low)
    } else if score >= 50.0 {
        (CheckStatus::Warning, Severity::Medium)
    } else {
        (CheckStatus::Critical, Severity::Critical)
    }
}

fn check_score(check: &HealthCheck) -> f64 {
    match check.status {
        CheckStatus::Excellent => 100.0,
        CheckStatus::Good => 85.0,
        CheckStatus::Warning => 60.0,
        CheckStatus::Critical => 20.0,
        // Benefit of the doubt: a check with no data yet shouldn't drag
        // the composite down before the system has had a chance to warm up.
        CheckStatus::Unknown => 100.0,
    }
}

/// All 7 weighted checks (spec §4.14), keyed by the name they're reported
/// under.
#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    pub hit_rate: HealthCheck,
    pub memory: HealthCheck,
    pub response_time: HealthCheck,
    pub error_rate: HealthCheck,
    pub eviction_rate: HealthCheck,
    pub connectivity: HealthCheck,
    pub monitoring: HealthCheck,
}

/// How many recent `health()` samples the trend/capacity projection look
/// back over (spec.md §4.14 "performance trend, capacity projection
/// (trend-based)"), matching the rolling-window size the quality monitor
/// already uses for its own Welford variance (`quality::QualityMonitorConfig
/// ::rolling_window`).
const TREND_WINDOW: usize = 30;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Counters {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bars_published: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors_total: u64,
    pub connections_active: u64,
    pub subscriptions_active: u64,
}

#[derive(Default)]
struct RawCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bars_published: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    errors_total: AtomicU64,
    connections_active: AtomicU64,
    subscriptions_active: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Ok,
    Warning,
    Critical,
}

/// Direction of the last `TREND_WINDOW` health-score samples, from the
/// health-checker composite in `original_source/.../health_checker/*.py`
/// (spec.md §9 supplement) — classified by linear-regression slope rather
/// than a naive first-vs-last comparison so a single noisy sample can't
/// flip the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTrend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub score: f64,
    pub level: AlertLevel,
    pub degraded: bool,
    pub open_breakers: usize,
    pub cache_hit_rate: f64,
    pub publish_latency_p99_us: u64,
    pub performance_trend: PerformanceTrend,
    /// Ticks (health-check intervals) until `connections_active` reaches
    /// `max_connections` at the current linear growth rate, or `None` if
    /// connection count isn't trending upward.
    pub capacity_ticks_to_saturation: Option<u64>,
    /// Per-check breakdown the weighted `score` is derived from (spec
    /// §4.14).
    pub checks: HealthChecks,
}

#[derive(Default)]
struct History {
    health_scores: VecDeque<f64>,
    connection_counts: VecDeque<u64>,
}

pub struct TelemetryCore {
    counters: RawCounters,
    histograms: RwLock<HashMap<&'static str, Arc<LatencyHistogram>>>,
    error_handler: Arc<ErrorHandler>,
    warning_threshold: f64,
    critical_threshold: f64,
    max_connections: usize,
    history: RwLock<History>,
}

impl TelemetryCore {
    pub fn new(error_handler: Arc<ErrorHandler>, max_connections: usize) -> Self {
        Self {
            counters: RawCounters::default(),
            histograms: RwLock::new(HashMap::new()),
            error_handler,
            warning_threshold: 70.0,
            critical_threshold: 40.0,
            max_connections,
            history: RwLock::new(History::default()),
        }
    }

    pub fn incr_messages_sent(&self) {
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_messages_received(&self) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_bars_published(&self, n: u64) {
        self.counters.bars_published.fetch_add(n, Ordering::Relaxed);
    }
    pub fn incr_cache_hit(&self) {
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_cache_miss(&self) {
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_error(&self) {
        self.counters.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn set_connections_active(&self, n: u64) {
        self.counters.connections_active.store(n, Ordering::Relaxed);
    }
    pub fn set_subscriptions_active(&self, n: u64) {
        self.counters.subscriptions_active.store(n, Ordering::Relaxed);
    }

    fn histogram(&self, op: &'static str) -> Arc<LatencyHistogram> {
        if let Some(h) = self.histograms.read().get(op) {
            return h.clone();
        }
        let mut histograms = self.histograms.write();
        histograms
            .entry(op)
            .or_insert_with(|| Arc::new(LatencyHistogram::new()))
            .clone()
    }

    pub fn record_latency(&self, op: &'static str, duration: std::time::Duration) {
        self.histogram(op).record_duration(duration);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            bars_published: self.counters.bars_published.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            errors_total: self.counters.errors_total.load(Ordering::Relaxed),
            connections_active: self.counters.connections_active.load(Ordering::Relaxed),
            subscriptions_active: self.counters.subscriptions_active.load(Ordering::Relaxed),
        }
    }

    fn cache_hit_rate(&self) -> f64 {
        let hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let misses = self.counters.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            1.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn check_hit_rate(&self) -> HealthCheck {
        let hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let misses = self.counters.cache_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return HealthCheck::unknown("no cache requests observed yet");
        }
        let hit_rate = self.cache_hit_rate();
        let score = hit_rate * 100.0;
        HealthCheck::from_score(
            score,
            format!("cache hit rate {:.1}%", score),
            json!({"hit_rate": hit_rate, "hits": hits, "misses": misses}),
            vec!["widen the adaptive TTL or prewarm more hot patterns"],
        )
    }

    fn check_memory(&self, cache: &CacheStats) -> HealthCheck {
        if cache.memory_ceiling_mb <= 0.0 {
            return HealthCheck::unknown("no memory ceiling configured");
        }
        let usage_ratio = (cache.memory_mb / cache.memory_ceiling_mb).min(1.0);
        let score = (1.0 - usage_ratio) * 100.0;
        HealthCheck::from_score(
            score,
            format!(
                "memory usage {:.1}MB / {:.1}MB ({:.1}%)",
                cache.memory_mb,
                cache.memory_ceiling_mb,
                usage_ratio * 100.0
            ),
            json!({"memory_mb": cache.memory_mb, "memory_ceiling_mb": cache.memory_ceiling_mb}),
            vec!["raise the cache memory ceiling or evict more aggressively"],
        )
    }

    fn check_response_time(&self) -> HealthCheck {
        let p99_us = self.histograms.read().get("get_bars").map(|h| h.p99());
        let Some(p99_us) = p99_us else {
            return HealthCheck::unknown("no query latency samples yet");
        };
        let score = if p99_us <= RESPONSE_EXCELLENT_US {
            100.0
        } else if p99_us <= RESPONSE_GOOD_US {
            80.0
        } else if p99_us <= RESPONSE_WARNING_US {
            55.0
        } else {
            15.0
        };
        HealthCheck::from_score(
            score,
            format!("p99 query latency {:.1}ms", p99_us as f64 / 1000.0),
            json!({"p99_us": p99_us}),
            vec!["investigate slow upstream source calls or cache misses"],
        )
    }

    fn check_error_rate(&self) -> HealthCheck {
        let errors = self.counters.errors_total.load(Ordering::Relaxed) as f64;
        let received = self.counters.messages_received.load(Ordering::Relaxed).max(1) as f64;
        let error_rate = (errors / received).min(1.0);
        let score = (1.0 - error_rate) * 100.0;
        HealthCheck::from_score(
            score,
            format!("error rate {:.2}%", error_rate * 100.0),
            json!({"error_rate": error_rate, "errors_total": errors as u64}),
            vec!["check recent error categories and open circuit breakers"],
        )
    }

    fn check_eviction_rate(&self, cache: &CacheStats) -> HealthCheck {
        if cache.requests == 0 {
            return HealthCheck::unknown("no cache requests observed yet");
        }
        let eviction_rate = cache.evictions as f64 / cache.requests as f64;
        let score = (1.0 - eviction_rate.min(1.0)) * 100.0;
        HealthCheck::from_score(
            score,
            format!("eviction rate {:.2}%", eviction_rate * 100.0),
            json!({"eviction_rate": eviction_rate, "evictions": cache.evictions}),
            vec!["raise the memory ceiling or L1/L2 entry caps"],
        )
    }

    fn check_connectivity(&self, open_breakers: usize) -> HealthCheck {
        let score = (1.0 - (open_breakers as f64 / ERROR_CATEGORY_COUNT).min(1.0)) * 100.0;
        HealthCheck::from_score(
            score,
            format!("{open_breakers} circuit breaker categor(y/ies) open"),
            json!({"open_breakers": open_breakers}),
            vec!["wait for breaker cooldown or investigate the upstream source"],
        )
    }

    fn check_monitoring(&self, degraded: bool) -> HealthCheck {
        if degraded {
            HealthCheck {
                status: CheckStatus::Critical,
                severity: Severity::Critical,
                message: "error handler reports degraded mode".to_string(),
                metrics: json!({"degraded": true}),
                recommendations: vec!["reduce incoming load until breakers recover".to_string()],
            }
        } else {
            HealthCheck {
                status: CheckStatus::Excellent,
                severity: Severity::Low,
                message: "monitoring nominal".to_string(),
                metrics: json!({"degraded": false}),
                recommendations: Vec::new(),
            }
        }
    }

    /// Weighted composite (spec §4.14): `hit_rate 0.25, memory 0.20,
    /// response_time 0.20, error_rate 0.15, eviction_rate 0.10,
    /// connectivity 0.05, monitoring 0.05`. Overall level is critical if
    /// any check is critical, warning if three or more checks warn,
    /// otherwise derived from the weighted score against the configured
    /// thresholds.
    pub fn health(&self, cache: &CacheStats) -> HealthReport {
        let open_breakers = self.error_handler.open_category_count();
        let degraded = self.error_handler.is_degraded();
        let cache_hit_rate = self.cache_hit_rate();

        let checks = HealthChecks {
            hit_rate: self.check_hit_rate(),
            memory: self.check_memory(cache),
            response_time: self.check_response_time(),
            error_rate: self.check_error_rate(),
            eviction_rate: self.check_eviction_rate(cache),
            connectivity: self.check_connectivity(open_breakers),
            monitoring: self.check_monitoring(degraded),
        };

        let score = check_score(&checks.hit_rate) * WEIGHT_HIT_RATE
            + check_score(&checks.memory) * WEIGHT_MEMORY
            + check_score(&checks.response_time) * WEIGHT_RESPONSE
            + check_score(&checks.error_rate) * WEIGHT_ERROR
            + check_score(&checks.eviction_rate) * WEIGHT_EVICTION
            + check_score(&checks.connectivity) * WEIGHT_CONNECTIVITY
            + check_score(&checks.monitoring) * WEIGHT_MONITORING;

        let statuses = [
            checks.hit_rate.status,
            checks.memory.status,
            checks.response_time.status,
            checks.error_rate.status,
            checks.eviction_rate.status,
            checks.connectivity.status,
            checks.monitoring.status,
        ];
        let critical_count = statuses.iter().filter(|s| **s == CheckStatus::Critical).count();
        let warning_count = statuses.iter().filter(|s| **s == CheckStatus::Warning).count();

        let level = if critical_count > 0 || degraded || score < self.critical_threshold {
            AlertLevel::Critical
        } else if warning_count >= 3 || score < self.warning_threshold {
            AlertLevel::Warning
        } else {
            AlertLevel::Ok
        };

        let publish_latency_p99_us = self
            .histograms
            .read()
            .get("publish")
            .map(|h| h.p99())
            .unwrap_or(0);

        let connections_active = self.counters.connections_active.load(Ordering::Relaxed);
        let (performance_trend, capacity_ticks_to_saturation) =
            self.record_and_project(score, connections_active);

        HealthReport {
            score,
            level,
            degraded,
            open_breakers,
            cache_hit_rate,
            publish_latency_p99_us,
            performance_trend,
            capacity_ticks_to_saturation,
            checks,
        }
    }

    /// Appends this tick's health score / connection count to the rolling
    /// history and re-derives the trend classification and capacity
    /// projection from it.
    fn record_and_project(&self, score: f64, connections: u64) -> (PerformanceTrend, Option<u64>) {
        let mut history = self.history.write();

        history.health_scores.push_back(score);
        if history.health_scores.len() > TREND_WINDOW {
            history.health_scores.pop_front();
        }
        history.connection_counts.push_back(connections);
        if history.connection_counts.len() > TREND_WINDOW {
            history.connection_counts.pop_front();
        }

        let trend = classify_trend(linear_slope(history.health_scores.iter().copied()));
        let projection = project_capacity(
            history.connection_counts.iter().copied(),
            self.max_connections,
        );
        (trend, projection)
    }

    /// Hand-rolled Prometheus text exposition, matching the teacher's own
    /// metrics exporter rather than a templating crate.
    pub fn to_prometheus(&self, cache: &CacheStats) -> String {
        let counters = self.counters();
        let health = self.health(cache);
        let mut out = String::new();

        out.push_str("# HELP marketdata_messages_sent_total Outbound WS messages\n");
        out.push_str("# TYPE marketdata_messages_sent_total counter\n");
        out.push_str(&format!("marketdata_messages_sent_total {}\n", counters.messages_sent));

        out.push_str("# HELP marketdata_messages_received_total Inbound WS messages\n");
        out.push_str("# TYPE marketdata_messages_received_total counter\n");
        out.push_str(&format!(
            "marketdata_messages_received_total {}\n",
            counters.messages_received
        ));

        out.push_str("# HELP marketdata_bars_published_total Bars fanned out to subscribers\n");
        out.push_str("# TYPE marketdata_bars_published_total counter\n");
        out.push_str(&format!("marketdata_bars_published_total {}\n", counters.bars_published));

        out.push_str("# HELP marketdata_cache_hit_rate Historical cache hit rate\n");
        out.push_str("# TYPE marketdata_cache_hit_rate gauge\n");
        out.push_str(&format!("marketdata_cache_hit_rate {:.4}\n", health.cache_hit_rate));

        out.push_str("# HELP marketdata_errors_total Errors recorded by the error handler\n");
        out.push_str("# TYPE marketdata_errors_total counter\n");
        out.push_str(&format!("marketdata_errors_total {}\n", counters.errors_total));

        out.push_str("# HELP marketdata_connections_active Active WS connections\n");
        out.push_str("# TYPE marketdata_connections_active gauge\n");
        out.push_str(&format!(
            "marketdata_connections_active {}\n",
            counters.connections_active
        ));

        out.push_str("# HELP marketdata_subscriptions_active Active subscriptions\n");
        out.push_str("# TYPE marketdata_subscriptions_active gauge\n");
        out.push_str(&format!(
            "marketdata_subscriptions_active {}\n",
            counters.subscriptions_active
        ));

        out.push_str("# HELP marketdata_health_score Weighted composite health score (0-100)\n");
        out.push_str("# TYPE marketdata_health_score gauge\n");
        out.push_str(&format!("marketdata_health_score {:.2}\n", health.score));

        out.push_str("# HELP marketdata_circuit_breakers_open Open circuit breaker categories\n");
        out.push_str("# TYPE marketdata_circuit_breakers_open gauge\n");
        out.push_str(&format!(
            "marketdata_circuit_breakers_open {}\n",
            health.open_breakers
        ));

        for (op, hist) in self.histograms.read().iter() {
            let summary = hist.summary(op);
            out.push_str(&format!(
                "marketdata_latency_us{{op=\"{op}\",quantile=\"0.5\"}} {}\n",
                summary.p50_us
            ));
            out.push_str(&format!(
                "marketdata_latency_us{{op=\"{op}\",quantile=\"0.99\"}} {}\n",
                summary.p99_us
            ));
            out.push_str(&format!("marketdata_latency_us_count{{op=\"{op}\"}} {}\n", summary.count));
        }

        if let Some(ticks) = health.capacity_ticks_to_saturation {
            out.push_str("# HELP marketdata_capacity_ticks_to_saturation Health-check ticks until connections_active reaches max_connections at current growth rate\n");
            out.push_str("# TYPE marketdata_capacity_ticks_to_saturation gauge\n");
            out.push_str(&format!("marketdata_capacity_ticks_to_saturation {ticks}\n"));
        }

        out
    }
}

/// Least-squares slope of `samples` treated as evenly-spaced y-values
/// (x = 0, 1, 2, ...). Returns 0.0 for fewer than two samples or a
/// perfectly flat x-variance (never happens here since x is the index).
fn linear_slope(samples: impl ExactSizeIterator<Item = f64>) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let ys: Vec<f64> = samples.collect();
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = ys.iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in ys.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Slope threshold (health-score points per tick) below which the trend is
/// reported as stable rather than improving/degrading — filters sampling
/// noise between otherwise-flat ticks.
const TREND_NOISE_FLOOR: f64 = 0.5;

fn classify_trend(slope: f64) -> PerformanceTrend {
    if slope > TREND_NOISE_FLOOR {
        PerformanceTrend::Improving
    } else if slope < -TREND_NOISE_FLOOR {
        PerformanceTrend::Degrading
    } else {
        PerformanceTrend::Stable
    }
}

/// Projects how many ticks until `connections_active` reaches
/// `max_connections`, assuming the current linear growth rate holds.
/// `None` when there's too little history or the count isn't growing;
/// an already-saturated count returns `Some(0)`.
fn project_capacity(counts: impl ExactSizeIterator<Item = u64>, max_connections: usize) -> Option<u64> {
    let counts: Vec<f64> = counts.map(|c| c as f64).collect();
    if counts.len() < 2 {
        return None;
    }
    let slope = linear_slope(counts.iter().copied());
    if slope <= 0.0 {
        return None;
    }
    let current = *counts.last().unwrap();
    let remaining = max_connections as f64 - current;
    if remaining <= 0.0 {
        return Some(0);
    }
    Some((remaining / slope).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BreakerConfig;

    fn core() -> TelemetryCore {
        TelemetryCore::new(Arc::new(ErrorHandler::new(BreakerConfig::default())), 1000)
    }

    /// A cache with no requests yet: every cache-sourced check reports
    /// `Unknown` (benefit of the doubt), isolating these tests to the
    /// telemetry-only checks (hit_rate via telemetry's own counters,
    /// error_rate, connectivity, monitoring).
    fn empty_cache_stats() -> CacheStats {
        CacheStats {
            hit_rate: 0.0,
            requests: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            memory_mb: 0.0,
            memory_ceiling_mb: 0.0,
            l1_size: 0,
            l2_size: 0,
            symbols: 0,
            periods: 0,
        }
    }

    #[test]
    fn health_score_is_perfect_when_nothing_failed() {
        let t = core();
        t.incr_messages_received();
        t.incr_cache_hit();
        let h = t.health(&empty_cache_stats());
        assert_eq!(h.level, AlertLevel::Ok);
        assert!(h.score > 90.0);
    }

    #[test]
    fn health_degrades_as_error_rate_rises() {
        let t = core();
        for _ in 0..10 {
            t.incr_messages_received();
            t.incr_error();
        }
        let h = t.health(&empty_cache_stats());
        // A single critical check (here: a 100% error rate) forces the
        // overall level to critical regardless of how the other six
        // (mostly unknown-status) checks weigh in.
        assert_eq!(h.checks.error_rate.status, CheckStatus::Critical);
        assert_eq!(h.level, AlertLevel::Critical);
    }

    #[test]
    fn memory_check_turns_critical_near_the_ceiling() {
        let t = core();
        let mut cache = empty_cache_stats();
        cache.memory_mb = 490.0;
        cache.memory_ceiling_mb = 512.0;
        let h = t.health(&cache);
        assert_eq!(h.checks.memory.status, CheckStatus::Critical);
    }

    #[test]
    fn eviction_check_unknown_without_any_requests() {
        let t = core();
        let h = t.health(&empty_cache_stats());
        assert_eq!(h.checks.eviction_rate.status, CheckStatus::Unknown);
    }

    #[test]
    fn three_warnings_escalate_overall_level_to_warning() {
        let t = core();
        // error_rate, memory and eviction_rate each land in the
        // warning band (score in [50, 75)) without any single check going
        // critical, tripping the ">=3 warnings" rule.
        for _ in 0..20 {
            t.incr_messages_received();
        }
        for _ in 0..6 {
            t.incr_error();
        }
        let mut cache = empty_cache_stats();
        cache.requests = 100;
        cache.evictions = 35;
        cache.memory_mb = 200.0;
        cache.memory_ceiling_mb = 512.0;
        let h = t.health(&cache);
        assert_eq!(h.level, AlertLevel::Warning);
    }

    #[test]
    fn prometheus_export_contains_core_series() {
        let t = core();
        t.incr_bars_published(5);
        let text = t.to_prometheus(&empty_cache_stats());
        assert!(text.contains("marketdata_bars_published_total 5"));
        assert!(text.contains("marketdata_health_score"));
    }

    #[test]
    fn steadily_rising_score_is_classified_improving() {
        let t = core();
        for i in 0..10 {
            // Drive cache hit rate up tick by tick so the composite score climbs.
            for _ in 0..i {
                t.incr_cache_hit();
            }
            t.incr_cache_miss();
            let _ = t.health(&empty_cache_stats());
        }
        let h = t.health(&empty_cache_stats());
        assert_eq!(h.performance_trend, PerformanceTrend::Improving);
    }

    #[test]
    fn flat_score_is_classified_stable() {
        let t = core();
        for _ in 0..5 {
            t.incr_messages_received();
            t.incr_cache_hit();
            let _ = t.health(&empty_cache_stats());
        }
        let h = t.health(&empty_cache_stats());
        assert_eq!(h.performance_trend, PerformanceTrend::Stable);
    }

    #[test]
    fn rising_connection_count_projects_a_finite_saturation() {
        let t = core();
        for n in (0..10).map(|i| i * 100) {
            t.set_connections_active(n);
            let _ = t.health(&empty_cache_stats());
        }
        let h = t.health(&empty_cache_stats());
        assert!(h.capacity_ticks_to_saturation.is_some());
    }

    #[test]
    fn flat_connection_count_never_projects_saturation() {
        let t = core();
        for _ in 0..5 {
            t.set_connections_active(10);
            let _ = t.health(&empty_cache_stats());
        }
        let h = t.health(&empty_cache_stats());
        assert_eq!(h.capacity_ticks_to_saturation, None);
    }
}
