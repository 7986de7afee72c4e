//! Error handler & circuit breaker (C14, spec §4.13).
//!
//! The breaker state machine (`Closed` → `Open` → `HalfOpen`) and its
//! failure/success counters are carried over from the route-quality
//! mitigation controller's per-endpoint `CircuitBreaker`
//! (teacher: `route_quality/mitigation.rs`), keyed here by
//! [`ErrorCategory`] instead of by endpoint name, since C14 trips per
//! failure class rather than per upstream host.

use crate::error::{AppError, ErrorCategory, ErrorRecord, Severity};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// What C14 tells the caller to do about an error after classifying and
/// recording it (spec §4.13 "recovery strategy table").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Transient; retry immediately is reasonable.
    Retry,
    /// Retry after a backoff delay.
    RetryWithBackoff,
    /// The circuit for this category is open; fail fast without retrying.
    FailFast,
    /// Not retryable; surface to the caller as-is.
    Propagate,
}

fn default_strategy(category: ErrorCategory) -> RecoveryStrategy {
    use ErrorCategory::*;
    match category {
        Network | Timeout | Source => RecoveryStrategy::RetryWithBackoff,
        RateLimit => RecoveryStrategy::RetryWithBackoff,
        Connection => RecoveryStrategy::Retry,
        Validation | Auth | Protocol | Subscription | Unknown => RecoveryStrategy::Propagate,
        System | Resource | DataPublish => RecoveryStrategy::Propagate,
    }
}

fn default_severity(category: ErrorCategory) -> Severity {
    use ErrorCategory::*;
    match category {
        Auth | System | Resource => Severity::Critical,
        Source | Connection | DataPublish | Protocol => Severity::High,
        Network | Timeout | RateLimit | Subscription => Severity::Medium,
        Validation | Unknown => Severity::Low,
    }
}

const ERROR_LOG_CAPACITY: usize = 1_000;

/// Central error handler: classifies, records, and trips a per-category
/// circuit breaker; also flags system-wide degradation once enough
/// categories are tripped at once (spec §4.13 "degradation flag").
pub struct ErrorHandler {
    config: BreakerConfig,
    breakers: RwLock<HashMap<ErrorCategory, Breaker>>,
    recent: Mutex<VecDeque<ErrorRecord>>,
    degraded_threshold: usize,
}

impl ErrorHandler {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(ERROR_LOG_CAPACITY)),
            degraded_threshold: 3,
        }
    }

    /// Records `err`, updates the category's breaker, and returns both the
    /// recovery strategy the caller should follow and the `ErrorRecord` to
    /// surface/log (spec §4.13, §7 error payload).
    pub fn handle(&self, err: &AppError) -> (RecoveryStrategy, ErrorRecord) {
        let category = err.category();
        let severity = default_severity(category);
        let record = ErrorRecord::new(err, severity);
        self.push_record(record.clone());

        let tripped = self.record_failure(category);
        let strategy = if tripped {
            warn!(category = %category, "circuit opened for error category");
            RecoveryStrategy::FailFast
        } else if self.is_open(category) {
            RecoveryStrategy::FailFast
        } else {
            default_strategy(category)
        };

        if matches!(severity, Severity::Critical) {
            error!(category = %category, message = %record.message, "critical error recorded");
        }

        (strategy, record)
    }

    /// Call on a successful operation in `category` to recover a half-open
    /// breaker or reset a closed one's failure streak.
    pub fn record_success(&self, category: ErrorCategory) {
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(category).or_default();
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.successes += 1;
                if breaker.successes >= self.config.success_threshold {
                    breaker.state = CircuitState::Closed;
                    breaker.failures = 0;
                    breaker.successes = 0;
                    info!(category = %category, "circuit closed");
                }
            }
            CircuitState::Closed => {
                breaker.failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Returns `true` exactly when this failure just tripped the breaker
    /// open (used to decide whether to log the transition once).
    fn record_failure(&self, category: ErrorCategory) -> bool {
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(category).or_default();
        breaker.failures += 1;
        breaker.successes = 0;
        if breaker.state != CircuitState::Open && breaker.failures >= self.config.failure_threshold
        {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// True when `category`'s breaker is currently open (and the
    /// half-open trial window hasn't arrived yet). Callers must consult
    /// this *before* invoking the underlying operation — spec §8 invariant
    /// 9: "the very next call in the same scope returns `ErrCircuitOpen`
    /// without invoking the underlying operation."
    pub fn is_category_open(&self, category: ErrorCategory) -> bool {
        self.is_open(category)
    }

    fn is_open(&self, category: ErrorCategory) -> bool {
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(category).or_default();
        match breaker.state {
            CircuitState::Open => {
                if let Some(opened_at) = breaker.opened_at {
                    if opened_at.elapsed() >= self.config.open_timeout {
                        breaker.state = CircuitState::HalfOpen;
                        breaker.successes = 0;
                        return false;
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn push_record(&self, record: ErrorRecord) {
        let mut recent = self.recent.lock();
        if recent.len() >= ERROR_LOG_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Number of error categories currently open — feeds the telemetry
    /// health score (spec §4.15).
    pub fn open_category_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| b.state == CircuitState::Open)
            .count()
    }

    /// True once enough categories are simultaneously open to call the
    /// service degraded rather than merely error-prone (spec §4.13
    /// "degradation flag").
    pub fn is_degraded(&self) -> bool {
        self.open_category_count() >= self.degraded_threshold
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let recent = self.recent.lock();
        recent.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn repeated_failures_open_the_breaker_and_fail_fast() {
        let handler = ErrorHandler::new(cfg());
        let err = AppError::SourceUnavailable("upstream down".into());
        let mut last_strategy = RecoveryStrategy::Propagate;
        for _ in 0..3 {
            let (strategy, _) = handler.handle(&err);
            last_strategy = strategy;
        }
        assert_eq!(last_strategy, RecoveryStrategy::FailFast);
        let (strategy_after, _) = handler.handle(&err);
        assert_eq!(strategy_after, RecoveryStrategy::FailFast);
    }

    #[test]
    fn half_open_recovers_to_closed_after_enough_successes() {
        let handler = ErrorHandler::new(cfg());
        let err = AppError::Timeout;
        for _ in 0..3 {
            handler.handle(&err);
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(!handler.is_open(ErrorCategory::Timeout));
        handler.record_success(ErrorCategory::Timeout);
        handler.record_success(ErrorCategory::Timeout);
        assert!(!handler.is_open(ErrorCategory::Timeout));
    }

    #[test]
    fn degradation_flag_trips_once_enough_categories_are_open() {
        let handler = ErrorHandler::new(cfg());
        for err in [
            AppError::SourceUnavailable("a".into()),
            AppError::Timeout,
            AppError::ConnectionLimitReached,
        ] {
            for _ in 0..3 {
                handler.handle(&err);
            }
        }
        assert!(handler.is_degraded());
    }
}
