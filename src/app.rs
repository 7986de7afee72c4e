//! Root application state (spec §9: "explicit `AppState`, constructed once
//! at startup and passed by reference" — replaces the teacher's
//! module-level `OnceCell`/`lazy_static` singletons with one object built
//! in `main` and threaded through `axum::State`).

use crate::cache::strategy::CacheStrategy;
use crate::cache::HistoricalCache;
use crate::config::Config;
use crate::normalize::Normalizer;
use crate::query::QueryEngine;
use crate::resilience::{BreakerConfig, ErrorHandler};
use crate::source::mock::MockBarSource;
use crate::source::native::{NativeBarSource, NativeSourceConfig};
use crate::source::BarSource;
use crate::telemetry::TelemetryCore;
use crate::ws::connection::ConnectionManager;
use crate::ws::heartbeat::HeartbeatSupervisor;
use crate::ws::publisher::{DataPublisher, LatestBarProvider};
use crate::ws::subscription::{SubscriptionIndex, SubscriptionKey};
use crate::ws::WsState;
use crate::middleware::rate_limit::{RateLimitConfig, RateLimitLayer};
use async_trait::async_trait;
use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const QUERY_ADMISSION_PERMITS: usize = 64;
const PUBLISH_TICK_PERIOD: Duration = Duration::from_millis(500);
const GC_HINT_INTERVAL: Duration = Duration::from_secs(60);
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const CACHE_STRATEGY_TICK: Duration = Duration::from_secs(600);
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(120);
/// Top-N hot keys refreshed per prewarm tick (spec §4.6 "top 20 by
/// priority_score").
const PREWARM_CANDIDATES: usize = 20;
/// Prewarm fetch concurrency (spec §4.6 "configured semaphore (default
/// 5)").
const PREWARM_CONCURRENCY: usize = 5;

/// Everything a handler needs, grouped the way the teacher groups its
/// per-domain state structs rather than one god-object with every field
/// flattened.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub query_engine: Arc<QueryEngine>,
    pub cache: Arc<HistoricalCache>,
    pub cache_strategy: Arc<CacheStrategy>,
    pub ws: WsState,
    pub telemetry: Arc<TelemetryCore>,
    pub rate_limiter: RateLimitLayer,
}

/// Looks up the latest bar for a subscription key from the historical
/// cache's most recent entry — the gateway has no separate live-tick feed
/// in this rewrite, so C12 is fed from C6 (spec §9 Open Question: "what
/// feeds the publisher" resolved in DESIGN.md).
struct CacheBackedProvider {
    cache: Arc<HistoricalCache>,
}

#[async_trait]
impl LatestBarProvider for CacheBackedProvider {
    async fn latest_bar(&self, key: &SubscriptionKey) -> Option<crate::bar::Bar> {
        self.cache.latest_bar_for(&key.symbol, key.period)
    }
}

/// Lets axum's `State<WsState>` extractor work on routes mounted against
/// `Router<AppState>` (the `/ws` upgrade handler needs only the WS slice,
/// not the whole app), so the router can be built with a single
/// `with_state(AppState)` instead of juggling two state types.
impl FromRef<AppState> for WsState {
    fn from_ref(state: &AppState) -> Self {
        state.ws.clone()
    }
}

impl AppState {
    /// Builds every component bottom-up and wires them together. Does not
    /// start any background task — that's `App::start`'s job, so
    /// constructing an `AppState` has no side effects (spec §9
    /// "constructors must not schedule work").
    pub fn build(config: Config) -> Self {
        let config = Arc::new(config);
        let error_handler = Arc::new(ErrorHandler::new(BreakerConfig::default()));
        let telemetry = Arc::new(TelemetryCore::new(error_handler.clone(), config.max_connections));
        let cache = Arc::new(HistoricalCache::default());
        let strategy = Arc::new(CacheStrategy::new());

        let source: Arc<dyn BarSource> = if std::env::var("MARKETDATA_SOURCE").as_deref()
            == Ok("native")
        {
            Arc::new(
                NativeBarSource::new(NativeSourceConfig::default())
                    .expect("native source client must build"),
            )
        } else {
            Arc::new(MockBarSource::new())
        };

        let query_engine = Arc::new(QueryEngine::new(
            source,
            Normalizer::default(),
            cache.clone(),
            strategy.clone(),
            error_handler.clone(),
            telemetry.clone(),
            QUERY_ADMISSION_PERMITS,
        ));

        let ws = WsState {
            subscriptions: Arc::new(SubscriptionIndex::new()),
            connections: Arc::new(ConnectionManager::new()),
            heartbeat: Arc::new(HeartbeatSupervisor::new(config.heartbeat_interval)),
            error_handler,
            telemetry: telemetry.clone(),
            max_subscriptions_per_client: config.max_subscriptions_per_client,
        };

        let rate_limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: config.rate_limit_rpm,
            window: Duration::from_secs(60),
            burst: (config.rate_limit_rpm / 5).max(1),
        });

        Self { config, query_engine, cache, cache_strategy: strategy, ws, telemetry, rate_limiter }
    }

    /// Spawns every background task a running instance needs: the publish
    /// tick, the heartbeat ping ticker, the hourly cache sweeper (C6), the
    /// 10-minute hot-pattern/adaptive-TTL sweep (C7), and the GC-hint
    /// ticker (C16). Mirrors the teacher's explicit `Start()`/`Stop()`
    /// lifecycle (spec §9) rather than spawning from `new`.
    pub fn start(&self) {
        let publisher = DataPublisher::new(
            self.ws.subscriptions.clone(),
            self.ws.connections.clone(),
            Arc::new(CacheBackedProvider { cache: self.cache.clone() }),
            self.telemetry.clone(),
            PUBLISH_TICK_PERIOD,
        );
        tokio::spawn(publisher.run());

        let heartbeat = self.ws.heartbeat.clone();
        let connections = self.ws.connections.clone();
        tokio::spawn(async move {
            crate::ws::heartbeat::run_ping_ticker(heartbeat.clone(), move |sup| {
                let ids = connections.client_ids();
                let ping = crate::ws::codec::OutboundFrame::Ping {
                    server_time: chrono::Utc::now().timestamp_millis(),
                };
                if let Ok(bytes) = serde_json::to_vec(&ping) {
                    connections.broadcast(&ids, Arc::new(bytes));
                }
                for lost in sup.sweep_missed(&ids) {
                    connections.disconnect(&lost);
                    sup.mark_lost(&lost);
                }
            })
            .await;
        });

        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        });

        let strategy = self.cache_strategy.clone();
        let query_engine = self.query_engine.clone();
        let error_handler_for_prewarm = self.ws.error_handler.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_STRATEGY_TICK);
            let prewarm_permits = std::sync::Arc::new(tokio::sync::Semaphore::new(PREWARM_CONCURRENCY));
            loop {
                ticker.tick().await;
                strategy.sweep();

                // spec §4.13 "while degraded, non-critical operations
                // (prewarm, quality analysis, batching optimizations) are
                // skipped; normal operations continue."
                if error_handler_for_prewarm.is_degraded() {
                    continue;
                }

                let candidates = strategy.prewarm_candidates(PREWARM_CANDIDATES);
                let refetches = candidates.iter().filter_map(|key| {
                    crate::cache::parse_bars_key(key).map(|(symbol, period, start, end)| {
                        let engine = query_engine.clone();
                        let permits = prewarm_permits.clone();
                        async move {
                            let Ok(_permit) = permits.acquire_owned().await else { return };
                            if let Err(err) = engine.get_bars(&symbol, period, start, end).await {
                                tracing::debug!(symbol, %period, %err, "prewarm fetch failed");
                            }
                        }
                    })
                });
                futures_util::future::join_all(refetches).await;
            }
        });

        tokio::spawn(crate::perf::run_gc_hint_ticker(GC_HINT_INTERVAL));

        let rate_limiter = self.rate_limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RATE_LIMIT_CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                rate_limiter.cleanup();
            }
        });

        info!("app state started: publisher, heartbeat, cache sweepers, rate-limit cleanup and GC-hint ticker running");
    }
}
