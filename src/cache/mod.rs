//! Two-tier historical cache (C6, spec §4.5).
//!
//! Fine-grained locking discipline per spec §5: L1 map, L2 map and the
//! three secondary indexes each live behind their own `parking_lot::RwLock`
//! so no cache operation ever holds one lock while acquiring another or
//! performing I/O — the same discipline the teacher applies to its
//! in-memory WS caches (`scrapers/polymarket_ws.rs::PolymarketMarketWsCache`
//! guards its `books` map independently of the command channel).

pub mod strategy;

use crate::bar::{Bar, Period};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum CachedPayload {
    Bars(Vec<Bar>),
    Quality(crate::quality::QualityReport),
}

impl CachedPayload {
    fn approx_size_bytes(&self) -> usize {
        match self {
            CachedPayload::Bars(bars) => bars.len() * Bar::APPROX_SIZE_BYTES + 64,
            CachedPayload::Quality(_) => 256,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedPayload,
    data_type: &'static str,
    period: Period,
    symbol: String,
    created_at: Instant,
    last_accessed: RwLockInstant,
    access_count: AtomicCounter,
    ttl: Duration,
    size_bytes: usize,
}

/// Small helpers so `CacheEntry` can sit behind a single `RwLock<HashMap<_,
/// _>>` per tier while still letting `get` bump access stats without an
/// exclusive lock on the whole map (interior mutability on the leaf fields
/// only).
#[derive(Debug)]
struct RwLockInstant(parking_lot::Mutex<Instant>);
impl Clone for RwLockInstant {
    fn clone(&self) -> Self {
        RwLockInstant(parking_lot::Mutex::new(*self.0.lock()))
    }
}
impl RwLockInstant {
    fn new(i: Instant) -> Self {
        RwLockInstant(parking_lot::Mutex::new(i))
    }
    fn get(&self) -> Instant {
        *self.0.lock()
    }
    fn set(&self, i: Instant) {
        *self.0.lock() = i;
    }
}

#[derive(Debug)]
struct AtomicCounter(AtomicU64);
impl Clone for AtomicCounter {
    fn clone(&self) -> Self {
        AtomicCounter(AtomicU64::new(self.0.load(Ordering::Relaxed)))
    }
}
impl AtomicCounter {
    fn new(v: u64) -> Self {
        AtomicCounter(AtomicU64::new(v))
    }
    fn incr(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hit_rate: f64,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_mb: f64,
    pub memory_ceiling_mb: f64,
    pub l1_size: usize,
    pub l2_size: usize,
    pub symbols: usize,
    pub periods: usize,
}

const L1_MAX_ENTRIES: usize = 10_000;
const L1_TTL: Duration = Duration::from_secs(3_600);
const L2_MAX_ENTRIES: usize = 50_000;

pub struct HistoricalCache {
    l1: RwLock<HashMap<String, CacheEntry>>,
    l2: RwLock<HashMap<String, CacheEntry>>,
    by_symbol: RwLock<HashMap<String, HashSet<String>>>,
    by_period: RwLock<HashMap<Period, HashSet<String>>>,
    by_data_type: RwLock<HashMap<&'static str, HashSet<String>>>,
    memory_ceiling_bytes: usize,
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for HistoricalCache {
    fn default() -> Self {
        Self::new(512 * 1024 * 1024)
    }
}

impl HistoricalCache {
    pub fn new(memory_ceiling_bytes: usize) -> Self {
        Self {
            l1: RwLock::new(HashMap::new()),
            l2: RwLock::new(HashMap::new()),
            by_symbol: RwLock::new(HashMap::new()),
            by_period: RwLock::new(HashMap::new()),
            by_data_type: RwLock::new(HashMap::new()),
            memory_ceiling_bytes,
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// `L1 -> L2`; promotes an L2 hit into L1 (spec §4.5).
    pub fn get(&self, key: &str) -> Option<CachedPayload> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        {
            let l1 = self.l1.read();
            if let Some(entry) = l1.get(key) {
                if !entry.is_expired(now) {
                    entry.last_accessed.set(now);
                    entry.access_count.incr();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
        }

        let promoted = {
            let l2 = self.l2.read();
            l2.get(key).filter(|e| !e.is_expired(now)).cloned()
        };

        if let Some(mut entry) = promoted {
            entry.last_accessed.set(now);
            entry.access_count.incr();
            entry.ttl = L1_TTL;
            entry.created_at = now;
            self.hits.fetch_add(1, Ordering::Relaxed);
            let value = entry.value.clone();
            self.insert_l1(key.to_string(), entry);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write-through to both tiers (spec §4.5 "Put writes to both").
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        key: String,
        value: CachedPayload,
        symbol: &str,
        period: Period,
        data_type: &'static str,
        ttl: Duration,
    ) {
        let now = Instant::now();
        let size_bytes = value.approx_size_bytes();
        let entry = CacheEntry {
            value,
            data_type,
            period,
            symbol: symbol.to_string(),
            created_at: now,
            last_accessed: RwLockInstant::new(now),
            access_count: AtomicCounter::new(0),
            ttl,
            size_bytes,
        };

        self.index_insert(&key, symbol, period, data_type);
        self.insert_l1(key.clone(), CacheEntry { ttl: L1_TTL, ..entry.clone() });
        self.insert_l2(key, entry);
        self.enforce_memory_ceiling();
    }

    fn index_insert(&self, key: &str, symbol: &str, period: Period, data_type: &'static str) {
        self.by_symbol
            .write()
            .entry(symbol.to_string())
            .or_default()
            .insert(key.to_string());
        self.by_period
            .write()
            .entry(period)
            .or_default()
            .insert(key.to_string());
        self.by_data_type
            .write()
            .entry(data_type)
            .or_default()
            .insert(key.to_string());
    }

    fn insert_l1(&self, key: String, entry: CacheEntry) {
        let mut l1 = self.l1.write();
        if l1.len() >= L1_MAX_ENTRIES && !l1.contains_key(&key) {
            evict_lru(&mut l1);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        l1.insert(key, entry);
    }

    fn insert_l2(&self, key: String, entry: CacheEntry) {
        let mut l2 = self.l2.write();
        if l2.len() >= L2_MAX_ENTRIES && !l2.contains_key(&key) {
            evict_lru(&mut l2);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        l2.insert(key, entry);
    }

    fn approx_memory_bytes(&self) -> usize {
        let l1_bytes: usize = self.l1.read().values().map(|e| e.size_bytes).sum();
        let l2_bytes: usize = self.l2.read().values().map(|e| e.size_bytes).sum();
        l1_bytes + l2_bytes
    }

    fn enforce_memory_ceiling(&self) {
        while self.approx_memory_bytes() > self.memory_ceiling_bytes {
            let evicted_l2 = {
                let mut l2 = self.l2.write();
                evict_lru(&mut l2)
            };
            if evicted_l2.is_none() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes every key indexed under `symbol` from both tiers and all
    /// indexes (spec §4.5 `InvalidateSymbol`).
    pub fn invalidate_symbol(&self, symbol: &str) {
        let keys: Vec<String> = self
            .by_symbol
            .write()
            .remove(symbol)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        self.purge_keys(&keys);
    }

    /// Spec §4.5 `InvalidatePeriod`.
    pub fn invalidate_period(&self, period: Period) {
        let keys: Vec<String> = self
            .by_period
            .write()
            .remove(&period)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        self.purge_keys(&keys);
    }

    fn purge_keys(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let key_set: HashSet<&str> = keys.iter().map(|s| s.as_str()).collect();
        {
            let mut l1 = self.l1.write();
            l1.retain(|k, _| !key_set.contains(k.as_str()));
        }
        {
            let mut l2 = self.l2.write();
            l2.retain(|k, _| !key_set.contains(k.as_str()));
        }
        let mut by_symbol = self.by_symbol.write();
        by_symbol.retain(|_, v| {
            v.retain(|k| !key_set.contains(k.as_str()));
            !v.is_empty()
        });
        let mut by_period = self.by_period.write();
        by_period.retain(|_, v| {
            v.retain(|k| !key_set.contains(k.as_str()));
            !v.is_empty()
        });
        let mut by_data_type = self.by_data_type.write();
        by_data_type.retain(|_, v| {
            v.retain(|k| !key_set.contains(k.as_str()));
            !v.is_empty()
        });
    }

    /// Hourly background sweep: drop TTL-expired entries in both tiers and
    /// reconcile the indexes (spec §4.5 "Background sweeper").
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired_l1: Vec<String> = self
            .l1
            .read()
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let expired_l2: Vec<String> = self
            .l2
            .read()
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        {
            let mut l1 = self.l1.write();
            for k in &expired_l1 {
                l1.remove(k);
            }
        }
        {
            let mut l2 = self.l2.write();
            for k in &expired_l2 {
                l2.remove(k);
            }
        }

        // Reconcile: a key only fully disappears from the indexes once it's
        // gone from both tiers.
        let l1 = self.l1.read();
        let l2 = self.l2.read();
        let still_alive = |k: &str| l1.contains_key(k) || l2.contains_key(k);

        let mut by_symbol = self.by_symbol.write();
        by_symbol.retain(|_, v| {
            v.retain(|k| still_alive(k));
            !v.is_empty()
        });
        let mut by_period = self.by_period.write();
        by_period.retain(|_, v| {
            v.retain(|k| still_alive(k));
            !v.is_empty()
        });
        let mut by_data_type = self.by_data_type.write();
        by_data_type.retain(|_, v| {
            v.retain(|k| still_alive(k));
            !v.is_empty()
        });
    }

    /// Most recent bar cached for `symbol`/`period`, used by C12 to fan out
    /// WS updates from the historical cache rather than a separate live
    /// feed (spec §9 Open Question, resolved in DESIGN.md: this gateway has
    /// no distinct tick source, so the publisher reads C6's freshest entry).
    pub fn latest_bar_for(&self, symbol: &str, period: Period) -> Option<Bar> {
        let l2 = self.l2.read();
        l2.values()
            .filter(|e| e.symbol == symbol && e.period == period && e.data_type == "kline")
            .max_by_key(|e| e.last_accessed.get())
            .and_then(|e| match &e.value {
                CachedPayload::Bars(bars) => bars.last().cloned(),
                CachedPayload::Quality(_) => None,
            })
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let requests = self.requests.load(Ordering::Relaxed);
        CacheStats {
            hit_rate: if requests == 0 {
                0.0
            } else {
                hits as f64 / requests as f64
            },
            requests,
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_mb: self.approx_memory_bytes() as f64 / (1024.0 * 1024.0),
            memory_ceiling_mb: self.memory_ceiling_bytes as f64 / (1024.0 * 1024.0),
            l1_size: self.l1.read().len(),
            l2_size: self.l2.read().len(),
            symbols: self.by_symbol.read().len(),
            periods: self.by_period.read().len(),
        }
    }
}

fn evict_lru(map: &mut HashMap<String, CacheEntry>) -> Option<String> {
    let lru_key = map
        .iter()
        .min_by_key(|(_, e)| e.last_accessed.get())
        .map(|(k, _)| k.clone());
    if let Some(ref k) = lru_key {
        map.remove(k);
    }
    lru_key
}

/// Builds the cache key for bar queries (spec §4.7 `"v1:{symbol}:{period}:{start}:{end}"`).
pub fn bars_key(symbol: &str, period: Period, start: &str, end: &str) -> String {
    format!("v1:{symbol}:{period}:{start}:{end}")
}

/// Builds the cache key for quality-only queries (spec §3 `"quality:{symbol}:{period}"`).
pub fn quality_key(symbol: &str, period: Period) -> String {
    format!("quality:{symbol}:{period}")
}

/// Inverse of [`bars_key`]: recovers `(symbol, period, start, end)` from a
/// `"v1:{symbol}:{period}:{start}:{end}"` key, used by C7's prewarm
/// scheduler to turn a hot cache key back into a fetchable request (spec
/// §4.6 "schedules prewarm fetches for them").
pub fn parse_bars_key(key: &str) -> Option<(String, Period, chrono::NaiveDate, chrono::NaiveDate)> {
    let mut parts = key.splitn(5, ':');
    if parts.next()? != "v1" {
        return None;
    }
    let symbol = parts.next()?.to_string();
    let period = Period::parse(parts.next()?)?;
    let start = chrono::NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
    let end = chrono::NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
    Some((symbol, period, start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::{Amount, Price};
    use std::time::Duration;

    fn sample_bar() -> Bar {
        Bar {
            symbol: "600519.SH".into(),
            timestamp: Utc::now(),
            open: Price::from_f64_banker_rounded(10.0),
            high: Price::from_f64_banker_rounded(10.5),
            low: Price::from_f64_banker_rounded(9.5),
            close: Price::from_f64_banker_rounded(10.2),
            volume: 100,
            amount: Amount::from_f64_banker_rounded(1000.0),
            quality_score: 1.0,
        }
    }

    #[test]
    fn put_then_get_round_trips_within_ttl() {
        let cache = HistoricalCache::default();
        let key = bars_key("600519.SH", Period::D1, "2023-12-01", "2023-12-05");
        cache.put(
            key.clone(),
            CachedPayload::Bars(vec![sample_bar()]),
            "600519.SH",
            Period::D1,
            "kline",
            Duration::from_secs(60),
        );
        let hit = cache.get(&key);
        assert!(hit.is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn invalidate_symbol_purges_both_tiers() {
        let cache = HistoricalCache::default();
        let key = bars_key("600519.SH", Period::D1, "2023-12-01", "2023-12-05");
        cache.put(
            key.clone(),
            CachedPayload::Bars(vec![sample_bar()]),
            "600519.SH",
            Period::D1,
            "kline",
            Duration::from_secs(60),
        );
        cache.invalidate_symbol("600519.SH");
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn miss_then_hit_reports_cached_metadata() {
        let cache = HistoricalCache::default();
        let key = bars_key("000001.SZ", Period::D1, "2024-01-01", "2024-01-02");
        assert!(cache.get(&key).is_none());
        cache.put(
            key.clone(),
            CachedPayload::Bars(vec![sample_bar()]),
            "000001.SZ",
            Period::D1,
            "kline",
            Duration::from_secs(60),
        );
        assert!(cache.get(&key).is_some());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn parse_bars_key_round_trips() {
        let key = bars_key("600519.SH", Period::D1, "2024-01-01", "2024-01-05");
        let (symbol, period, start, end) = parse_bars_key(&key).unwrap();
        assert_eq!(symbol, "600519.SH");
        assert_eq!(period, Period::D1);
        assert_eq!(start, chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(end, chrono::NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
    }

    #[test]
    fn parse_bars_key_rejects_quality_keys() {
        assert!(parse_bars_key(&quality_key("600519.SH", Period::D1)).is_none());
    }
}
