//! Typed startup configuration (spec §6 "Environment / configuration").
//!
//! Mirrors the teacher's `load_env()` + typed `Config` split: one explicit
//! loader reads the process environment once at startup; every other module
//! receives its slice of config by value or reference, never by re-reading
//! `std::env`.

use clap::Parser;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceDiscoveryBackend {
    None,
    Consul,
    Etcd,
    Kubernetes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastConnections,
    IpHash,
}

/// CLI overrides for the environment-driven configuration. Every field has
/// an environment-variable fallback named per spec §6; `clap`'s `env`
/// feature wires that up directly instead of hand-rolled `std::env::var`
/// calls scattered through the codebase.
#[derive(Debug, Parser, Clone)]
#[command(name = "marketdata-gateway", about = "Real-time market data gateway")]
pub struct CliArgs {
    #[arg(long, env = "WEBSOCKET_HOST", default_value = "0.0.0.0")]
    pub websocket_host: String,

    #[arg(long, env = "WEBSOCKET_PORT", default_value_t = 8765)]
    pub websocket_port: u16,

    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 10_000)]
    pub max_connections: usize,

    #[arg(long, env = "MAX_SUBSCRIPTIONS_PER_CLIENT", default_value_t = 100)]
    pub max_subscriptions_per_client: usize,

    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "RATE_LIMIT_RPM", default_value_t = 600)]
    pub rate_limit_rpm: u32,

    #[arg(long, env = "ENABLE_AUTH", default_value_t = false)]
    pub enable_auth: bool,

    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,

    #[arg(long, env = "SSL_ENABLED", default_value_t = false)]
    pub ssl_enabled: bool,

    #[arg(long, env = "SSL_CERT_PATH")]
    pub ssl_cert_path: Option<String>,

    #[arg(long, env = "SSL_KEY_PATH")]
    pub ssl_key_path: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FILE_PATH")]
    pub log_file_path: Option<String>,

    #[arg(long, env = "MONITORING_ENABLED", default_value_t = true)]
    pub monitoring_enabled: bool,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9100)]
    pub metrics_port: u16,

    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,
}

/// Fully resolved configuration handed to `App::build`.
#[derive(Debug, Clone)]
pub struct Config {
    pub websocket_host: String,
    pub websocket_port: u16,
    pub http_port: u16,
    pub max_connections: usize,
    pub max_subscriptions_per_client: usize,
    pub heartbeat_interval: Duration,
    pub rate_limit_rpm: u32,
    pub enable_auth: bool,
    pub auth_token: Option<String>,
    pub ssl_enabled: bool,
    pub ssl_cert_path: Option<String>,
    pub ssl_key_path: Option<String>,
    pub log_level: String,
    pub log_file_path: Option<String>,
    pub monitoring_enabled: bool,
    pub metrics_port: u16,
    pub shutdown_timeout: Duration,
    pub service_discovery: ServiceDiscoveryBackend,
    pub load_balancing: LoadBalancingStrategy,
}

impl From<CliArgs> for Config {
    fn from(a: CliArgs) -> Self {
        let service_discovery = match std::env::var("SERVICE_DISCOVERY_BACKEND").as_deref() {
            Ok("consul") => ServiceDiscoveryBackend::Consul,
            Ok("etcd") => ServiceDiscoveryBackend::Etcd,
            Ok("kubernetes") => ServiceDiscoveryBackend::Kubernetes,
            _ => ServiceDiscoveryBackend::None,
        };
        let load_balancing = match std::env::var("LOAD_BALANCING_STRATEGY").as_deref() {
            Ok("least_connections") => LoadBalancingStrategy::LeastConnections,
            Ok("ip_hash") => LoadBalancingStrategy::IpHash,
            _ => LoadBalancingStrategy::RoundRobin,
        };

        Self {
            websocket_host: a.websocket_host,
            websocket_port: a.websocket_port,
            http_port: a.http_port,
            max_connections: a.max_connections,
            max_subscriptions_per_client: a.max_subscriptions_per_client,
            heartbeat_interval: Duration::from_secs(a.heartbeat_interval_secs),
            rate_limit_rpm: a.rate_limit_rpm,
            enable_auth: a.enable_auth,
            auth_token: a.auth_token,
            ssl_enabled: a.ssl_enabled,
            ssl_cert_path: a.ssl_cert_path,
            ssl_key_path: a.ssl_key_path,
            log_level: a.log_level,
            log_file_path: a.log_file_path,
            monitoring_enabled: a.monitoring_enabled,
            metrics_port: a.metrics_port,
            shutdown_timeout: Duration::from_secs(a.shutdown_timeout_secs),
            service_discovery,
            load_balancing,
        }
    }
}

impl Config {
    /// Loads configuration from CLI args + environment. Never called from a
    /// constructor; only from `main` (spec §9 "constructors must not
    /// schedule work" — extended here to "must not read ambient state").
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        CliArgs::parse().into()
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        CliArgs::parse_from(["test"]).into()
    }
}
