//! Closed error taxonomy shared by every component (spec §4.13, §7).
//!
//! Library modules return `Result<T, AppError>`; binaries and HTTP/WS glue
//! use `anyhow::Result` the way `main.rs` already does and convert at the
//! boundary with `AppError::category()`.

use serde::Serialize;
use std::fmt;

/// The closed set of error categories the recovery-strategy table (C14) and
/// the telemetry pattern detector (C15) key off of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Subscription,
    DataPublish,
    Auth,
    Validation,
    Network,
    System,
    Resource,
    Timeout,
    Protocol,
    RateLimit,
    Source,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Connection => "connection",
            ErrorCategory::Subscription => "subscription",
            ErrorCategory::DataPublish => "data_publish",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Network => "network",
            ErrorCategory::System => "system",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Source => "source",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Severity attached to a surfaced error frame / log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // C2 data-source adapter
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("data source returned no data")]
    NoData,
    #[error("data source timed out after {0:?}")]
    SourceTimeout(std::time::Duration),
    #[error("data source returned an unparseable response: {0}")]
    SourceProtocol(String),

    // C3 normalizer
    #[error("missing required fields: {0:?}")]
    MissingRequiredField(Vec<&'static str>),
    #[error("could not coerce value: {0}")]
    MalformedValue(String),

    // C8 query engine / validation
    #[error("invalid request: {0}")]
    Validation(String),

    // C9 subscription index
    #[error("subscription cap of {0} reached")]
    SubscriptionCapReached(usize),
    #[error("unknown data type: {0}")]
    UnknownDataType(String),
    #[error("invalid symbol format: {0}")]
    InvalidSymbol(String),

    // C10 connection manager / auth
    #[error("authentication failed")]
    Auth,
    #[error("connection limit reached")]
    ConnectionLimitReached,

    // C11 message router & codec
    #[error("frame exceeds maximum size")]
    FrameTooLarge,
    #[error("unknown message type: {0}")]
    UnknownType(String),

    // C14 circuit breaker
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("operation timed out")]
    Timeout,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("internal error: {0}")]
    System(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl AppError {
    /// Maps every variant onto the closed taxonomy (spec §4.13).
    pub fn category(&self) -> ErrorCategory {
        use AppError::*;
        match self {
            SourceUnavailable(_) | NoData | SourceProtocol(_) => ErrorCategory::Source,
            SourceTimeout(_) => ErrorCategory::Timeout,
            MissingRequiredField(_) | MalformedValue(_) | Validation(_) => {
                ErrorCategory::Validation
            }
            SubscriptionCapReached(_) | UnknownDataType(_) | InvalidSymbol(_) => {
                ErrorCategory::Subscription
            }
            Auth => ErrorCategory::Auth,
            ConnectionLimitReached => ErrorCategory::Connection,
            FrameTooLarge | UnknownType(_) => ErrorCategory::Protocol,
            CircuitOpen(_) => ErrorCategory::Resource,
            Timeout => ErrorCategory::Timeout,
            RateLimitExceeded => ErrorCategory::RateLimit,
            System(_) => ErrorCategory::System,
            Unknown(_) => ErrorCategory::Unknown,
        }
    }

    /// Human-readable message never leaking internals (spec §7: "never
    /// leaks stack traces").
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

/// A typed error record as logged by C14 and surfaced over the wire (spec
/// §6 error payload, §4.13 bounded error log).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub error_id: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub client_id: Option<String>,
    pub subscription_id: Option<String>,
    pub trace_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorRecord {
    pub fn new(err: &AppError, severity: Severity) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            category: err.category(),
            severity,
            message: err.client_message(),
            client_id: None,
            subscription_id: None,
            trace_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_subscription(mut self, sub_id: impl Into<String>) -> Self {
        self.subscription_id = Some(sub_id.into());
        self
    }
}
