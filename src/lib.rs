//! Real-time market data gateway.
//!
//! Exposes every domain module for use by the `marketdata-gateway` binary
//! and by integration tests. Nothing here spawns a background task or
//! touches the environment at import time (spec §9): construction is
//! [`app::AppState::build`], lifecycle is explicit [`app::AppState::start`].

pub mod app;
pub mod bar;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod normalize;
pub mod perf;
pub mod period;
pub mod quality;
pub mod query;
pub mod resilience;
pub mod source;
pub mod telemetry;
pub mod ws;
