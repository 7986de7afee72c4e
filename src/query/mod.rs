//! Historical query engine (C8, spec §4.7).
//!
//! Single entry point for `GetBars`/`GetMultiPeriod`/`GetBatch`. Every
//! retry/breaker/monitoring concern lives here, once, rather than being
//! duplicated per call site — the consolidation spec §9 calls for instead
//! of the original's "cache decorator repeated per endpoint" anti-pattern.
//! The bounded concurrent fan-out for `GetBatch` is grounded in
//! [`crate::perf::RequestAdmission`] (itself grounded on the original
//! `BatchDataOptimizer`'s semaphore).

use crate::bar::{Bar, Period};
use crate::cache::strategy::CacheStrategy;
use crate::cache::{bars_key, quality_key, CachedPayload, HistoricalCache};
use crate::error::{AppError, ErrorCategory};
use crate::normalize::Normalizer;
use crate::perf::RequestAdmission;
use crate::quality::{self, QualityMonitorConfig, QualityReport};
use crate::resilience::{ErrorHandler, RecoveryStrategy};
use crate::source::BarSource;
use crate::telemetry::TelemetryCore;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 2;
const BASE_BACKOFF: Duration = Duration::from_millis(200);

pub struct QueryEngine {
    source: Arc<dyn BarSource>,
    normalizer: Normalizer,
    cache: Arc<HistoricalCache>,
    strategy: Arc<CacheStrategy>,
    error_handler: Arc<ErrorHandler>,
    telemetry: Arc<TelemetryCore>,
    admission: RequestAdmission,
    quality_config: QualityMonitorConfig,
}

#[derive(Debug, Clone)]
pub struct BarsResponse {
    pub bars: Vec<Bar>,
    pub quality: QualityReport,
    pub from_cache: bool,
}

impl QueryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn BarSource>,
        normalizer: Normalizer,
        cache: Arc<HistoricalCache>,
        strategy: Arc<CacheStrategy>,
        error_handler: Arc<ErrorHandler>,
        telemetry: Arc<TelemetryCore>,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            source,
            normalizer,
            cache,
            strategy,
            error_handler,
            telemetry,
            admission: RequestAdmission::new(max_concurrent_requests),
            quality_config: QualityMonitorConfig::default(),
        }
    }

    /// `GetBars` (spec §4.7): fetch, normalize, quality-assess and cache a
    /// single symbol/period/range. Equivalent to
    /// [`Self::get_bars_opts`] with `use_cache = true`.
    pub async fn get_bars(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BarsResponse, AppError> {
        self.get_bars_opts(symbol, period, start, end, true).await
    }

    /// `GetBars` with the `use_cache` request flag (spec §4.7 step 2/7):
    /// when `false`, the cache is consulted neither for reads nor writes —
    /// distinct from [`Self::invalidate_symbol`], which purges every
    /// period cached for a symbol rather than bypassing just this request.
    pub async fn get_bars_opts(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
        use_cache: bool,
    ) -> Result<BarsResponse, AppError> {
        if start > end {
            return Err(AppError::Validation(format!("start {start} is after end {end}")));
        }

        let key = bars_key(symbol, period, &start.to_string(), &end.to_string());

        if use_cache {
            let cached = self.cache.get(&key);
            let hit = matches!(cached, Some(CachedPayload::Bars(_)));
            self.strategy.record_access(symbol, period, &key, hit);
            if let Some(CachedPayload::Bars(bars)) = cached {
                self.telemetry.incr_cache_hit();
                let quality = quality::assess(&bars, period.cadence_secs(), &self.quality_config);
                return Ok(BarsResponse { bars, quality, from_cache: true });
            }
            self.telemetry.incr_cache_miss();
        }

        let _permit = self.admission.acquire().await;
        let fetch_started = std::time::Instant::now();
        let bars = self.fetch_with_policy(symbol, period, start, end).await?;
        self.telemetry.record_latency("get_bars", fetch_started.elapsed());
        let quality = quality::assess(&bars, period.cadence_secs(), &self.quality_config);

        if use_cache {
            let ttl = self
                .strategy
                .adaptive_ttl(period, Duration::from_secs(period.default_ttl_secs()));
            self.cache.put(
                key.clone(),
                CachedPayload::Bars(bars.clone()),
                symbol,
                period,
                "kline",
                ttl,
            );
            self.cache.put(
                quality_key(symbol, period),
                CachedPayload::Quality(quality.clone()),
                symbol,
                period,
                "quality",
                ttl,
            );
        }

        Ok(BarsResponse { bars, quality, from_cache: false })
    }

    /// `GetMultiPeriod` (spec §4.7): runs one `GetBars` per requested period
    /// concurrently (admission-bounded same as any other call); each
    /// period's outcome is independent — one period's source error leaves
    /// that entry empty rather than aborting the others (spec §8 scenario
    /// C).
    pub async fn get_multi_period(
        &self,
        symbol: &str,
        periods: &[Period],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<(Period, Result<BarsResponse, AppError>)> {
        let futures = periods
            .iter()
            .map(|&period| async move { (period, self.get_bars(symbol, period, start, end).await) });
        futures_util::future::join_all(futures).await
    }

    /// `GetBatch` (spec §4.7): runs every symbol's `GetBars` concurrently,
    /// bounded by the same [`RequestAdmission`] semaphore `fetch_with_policy`
    /// acquires around (default 5, spec §4.7) — order of completion is
    /// irrelevant, and a single symbol's error never aborts the others.
    pub async fn get_batch(
        &self,
        requests: Vec<(String, Period, NaiveDate, NaiveDate)>,
    ) -> Vec<(String, Result<BarsResponse, AppError>)> {
        let futures = requests.into_iter().map(|(symbol, period, start, end)| async move {
            let result = self.get_bars(&symbol, period, start, end).await;
            (symbol, result)
        });
        futures_util::future::join_all(futures).await
    }

    /// Applies retry-with-backoff and circuit-breaker policy around a raw
    /// source fetch + normalize pass (spec §4.13 "C14 wraps every C8
    /// call").
    async fn fetch_with_policy(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, AppError> {
        // spec §8 invariant 9 / scenario F: once the source breaker is
        // open, fail fast without contacting the source at all. One trial
        // call is admitted per half-open window by `is_category_open`
        // itself (Open -> HalfOpen transition happens inside it).
        if self.error_handler.is_category_open(ErrorCategory::Source) {
            return Err(AppError::CircuitOpen(ErrorCategory::Source.to_string()));
        }

        let mut attempt = 0;
        loop {
            match self.try_fetch_once(symbol, period, start, end).await {
                Ok(bars) => {
                    self.error_handler.record_success(ErrorCategory::Source);
                    return Ok(bars);
                }
                Err(err) => {
                    self.telemetry.incr_error();
                    let (strategy, record) = self.error_handler.handle(&err);
                    warn!(symbol, %period, error = %record.message, attempt, "fetch attempt failed");

                    match strategy {
                        RecoveryStrategy::Retry | RecoveryStrategy::RetryWithBackoff
                            if attempt < MAX_RETRIES =>
                        {
                            attempt += 1;
                            if matches!(strategy, RecoveryStrategy::RetryWithBackoff) {
                                tokio::time::sleep(BASE_BACKOFF * attempt).await;
                            }
                            continue;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    async fn try_fetch_once(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, AppError> {
        let records = self.source.fetch_bars(symbol, period, start, end).await?;
        if records.is_empty() {
            info!(symbol, %period, "source returned no records");
        }
        self.normalizer.normalize(symbol, records)
    }

    pub fn invalidate_symbol(&self, symbol: &str) {
        self.cache.invalidate_symbol(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::MockBarSource;
    use async_trait::async_trait;

    fn engine(source: Arc<dyn BarSource>) -> QueryEngine {
        QueryEngine::new(
            source,
            Normalizer::default(),
            Arc::new(HistoricalCache::default()),
            Arc::new(CacheStrategy::new()),
            Arc::new(ErrorHandler::new(Default::default())),
            Arc::new(TelemetryCore::new(Arc::new(ErrorHandler::new(Default::default())), 1000)),
            8,
        )
    }

    #[tokio::test]
    async fn get_bars_populates_cache_on_miss_then_hits() {
        let source = Arc::new(MockBarSource::new());
        let engine = engine(source);
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();

        let first = engine.get_bars("600519.SH", Period::D1, start, end).await.unwrap();
        assert!(!first.from_cache);

        let second = engine.get_bars("600519.SH", Period::D1, start, end).await.unwrap();
        assert!(second.from_cache);
    }

    #[tokio::test]
    async fn invalid_range_is_rejected() {
        let source = Arc::new(MockBarSource::new());
        let engine = engine(source);
        let start = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = engine.get_bars("600519.SH", Period::D1, start, end).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    struct AlwaysFails;

    #[async_trait]
    impl BarSource for AlwaysFails {
        async fn fetch_bars(
            &self,
            _symbol: &str,
            _period: Period,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<crate::source::RawRecord>, AppError> {
            Err(AppError::SourceUnavailable("down".into()))
        }
        fn name(&self) -> &'static str {
            "always-fails"
        }
    }

    #[tokio::test]
    async fn persistent_failure_propagates_after_retries_exhausted() {
        let engine = engine(Arc::new(AlwaysFails));
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let err = engine.get_bars("600519.SH", Period::D1, start, end).await.unwrap_err();
        assert!(matches!(err, AppError::SourceUnavailable(_)));
    }

    struct CountingFails {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl BarSource for CountingFails {
        async fn fetch_bars(
            &self,
            _symbol: &str,
            _period: Period,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<crate::source::RawRecord>, AppError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(AppError::SourceUnavailable("down".into()))
        }
        fn name(&self) -> &'static str {
            "counting-fails"
        }
    }

    /// spec §8 invariant 9 / scenario F: once the breaker for the source
    /// category trips, the next call fails fast without ever reaching the
    /// source, and the source's own call count stops growing.
    #[tokio::test]
    async fn circuit_breaker_fails_fast_without_contacting_source() {
        let source = Arc::new(CountingFails { calls: std::sync::atomic::AtomicUsize::new(0) });
        let engine = engine(source.clone());
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        // Two requests accumulate >= BreakerConfig::default().failure_threshold
        // (5) failures across their internal retries and trip the breaker.
        for _ in 0..2 {
            let _ = engine.get_bars("AAA.SH", Period::D1, start, end).await;
        }
        let calls_before = source.calls.load(std::sync::atomic::Ordering::SeqCst);

        let err = engine.get_bars("AAA.SH", Period::D1, start, end).await.unwrap_err();
        assert!(matches!(err, AppError::CircuitOpen(_)));
        let calls_after = source.calls.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(calls_before, calls_after, "source must not be contacted while circuit is open");
    }
}
