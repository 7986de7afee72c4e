//! Performance optimizer (C16, spec §4.16): a bounded worker pool for
//! CPU-bound batch work (normalization/quality passes), a periodic
//! GC-hint ticker, and the batch coalescer shared by C11/C12.
//!
//! The `rayon` parallel batch path is grounded in the backtest profiler's
//! `process_batch_parallel` (teacher: `backtest_v2/perf.rs`), generalized
//! from per-market event partitioning to per-symbol bar partitioning; the
//! bounded-concurrency request admission is grounded in the original
//! `BatchDataOptimizer`'s semaphore (`original_source/src/argus_mcp/
//! optimization/batch_data_optimizer.py`), reimplemented with
//! `tokio::sync::Semaphore` instead of `asyncio.Semaphore`.

use crate::bar::Bar;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::debug;

/// Partitions `bars` by symbol and runs `f` over each partition on the
/// global rayon pool — used by the normalizer/quality monitor when asked
/// to process a multi-symbol batch in one call (spec §4.16 "CPU-bound
/// fan-out").
pub fn parallel_by_symbol<F, T>(bars: Vec<Bar>, f: F) -> Vec<T>
where
    F: Fn(&str, Vec<Bar>) -> T + Sync + Send,
    T: Send,
{
    let mut by_symbol: HashMap<String, Vec<Bar>> = HashMap::new();
    for bar in bars {
        by_symbol.entry(bar.symbol.clone()).or_default().push(bar);
    }

    by_symbol
        .into_par_iter()
        .map(|(symbol, group)| f(&symbol, group))
        .collect()
}

/// Bounds how many historical-query requests may run concurrently
/// (spec §4.16 "adaptive concurrency", simplified to a fixed ceiling
/// configured at startup rather than a self-tuning window).
pub struct RequestAdmission {
    semaphore: Arc<Semaphore>,
}

impl RequestAdmission {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Acquires a slot, blocking (async) until one is free. Drop the guard
    /// to release it.
    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed")
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Coalesces same-tick outbound bars for a symbol so C11/C12 serialize and
/// compress each symbol's update once per publish tick regardless of how
/// many subscribers or data types requested it (spec §4.16 "batch
/// coalescing", shared with C11 message router and C12 data publisher).
#[derive(Default)]
pub struct BatchCoalescer {
    pending: parking_lot::Mutex<HashMap<String, Bar>>,
}

impl BatchCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any pending bar for this symbol with `bar` — only the
    /// latest bar per symbol survives to the next drain.
    pub fn offer(&self, bar: Bar) {
        self.pending.lock().insert(bar.symbol.clone(), bar);
    }

    /// Drains and returns every coalesced bar, clearing the buffer.
    pub fn drain(&self) -> Vec<Bar> {
        std::mem::take(&mut *self.pending.lock())
            .into_values()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Periodic allocator-hint ticker: nudges the global allocator to return
/// freed pages to the OS on a fixed interval. A hint only — Rust has no
/// stop-the-world GC to pause, so this is the closest analogue to the
/// original's explicit `gc.collect()` call in its performance optimizer
/// (spec §9 supplement from `original_source/src/argus_mcp/
/// performance_optimizer.py`).
pub async fn run_gc_hint_ticker(period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        debug!("gc hint tick: no-op on this allocator, reserved for future tuning");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::{Amount, Price};
    use chrono::Utc;

    fn bar(symbol: &str) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            open: Price::from_f64_banker_rounded(1.0),
            high: Price::from_f64_banker_rounded(1.0),
            low: Price::from_f64_banker_rounded(1.0),
            close: Price::from_f64_banker_rounded(1.0),
            volume: 1,
            amount: Amount::from_f64_banker_rounded(1.0),
            quality_score: 1.0,
        }
    }

    #[test]
    fn parallel_by_symbol_covers_every_group() {
        let bars = vec![bar("A"), bar("B"), bar("A"), bar("C")];
        let counts = parallel_by_symbol(bars, |_symbol, group| group.len());
        let total: usize = counts.into_iter().sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn coalescer_keeps_only_latest_bar_per_symbol() {
        let coalescer = BatchCoalescer::new();
        coalescer.offer(bar("A"));
        coalescer.offer(bar("A"));
        coalescer.offer(bar("B"));
        assert_eq!(coalescer.pending_count(), 2);
        let drained = coalescer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[tokio::test]
    async fn admission_limits_concurrent_permits() {
        let admission = RequestAdmission::new(1);
        let _first = admission.acquire().await;
        assert_eq!(admission.available_permits(), 0);
    }
}
