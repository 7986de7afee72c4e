//! Adapter over the upstream native market-data library (modeled per spec
//! §1/§4.1 as a pluggable implementation of `BarSource`; the real "xtquant"
//! native library is out of scope — this wraps whatever HTTP mirror or FFI
//! shim is configured behind it).
//!
//! Exposes a primary call surface and a simpler fallback surface, tried in
//! order (spec §4.1): some deployments of the native library support a rich
//! range query; others only a single-day snapshot call that this adapter
//! loops over date-by-date.

use super::{format_native_date, BarSource, RawRecord};
use crate::bar::Period;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct NativeSourceConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for NativeSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:58610".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Wraps the native library's HTTP shim. Not loadable (connection refused /
/// DNS failure) maps to `ErrSourceUnavailable`; a healthy empty response
/// maps to `ErrNoData`; anything that fails to parse maps to
/// `ErrSourceProtocol`.
pub struct NativeBarSource {
    client: Client,
    config: NativeSourceConfig,
}

impl NativeBarSource {
    pub fn new(config: NativeSourceConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::System(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn fetch_range_primary(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRecord>, AppError> {
        let url = format!("{}/kline/range", self.config.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("period", period.as_str()),
                ("start", &format_native_date(start)),
                ("end", &format_native_date(end)),
            ])
            .send()
            .await
            .map_err(classify_reqwest_err)?;

        if !resp.status().is_success() {
            return Err(AppError::SourceProtocol(format!(
                "range endpoint returned {}",
                resp.status()
            )));
        }

        let body: Vec<RawRecord> = resp
            .json()
            .await
            .map_err(|e| AppError::SourceProtocol(format!("unparseable range response: {e}")))?;
        Ok(body)
    }

    /// The simpler fallback surface some native-library builds only expose:
    /// a single per-day snapshot call, looped over the requested range.
    async fn fetch_range_fallback(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRecord>, AppError> {
        let mut out = Vec::new();
        let mut day = start;
        while day <= end {
            let url = format!("{}/kline/day", self.config.base_url);
            let resp = self
                .client
                .get(&url)
                .query(&[
                    ("symbol", symbol),
                    ("period", period.as_str()),
                    ("date", &format_native_date(day)),
                ])
                .send()
                .await
                .map_err(classify_reqwest_err)?;

            if resp.status().is_success() {
                let mut records: Vec<RawRecord> = resp.json().await.map_err(|e| {
                    AppError::SourceProtocol(format!("unparseable day response: {e}"))
                })?;
                out.append(&mut records);
            } else if resp.status().as_u16() != 404 {
                return Err(AppError::SourceProtocol(format!(
                    "day endpoint returned {}",
                    resp.status()
                )));
            }

            day = day.succ_opt().unwrap_or(day);
            if day == start {
                break; // succ_opt saturated; avoid an infinite loop at the date boundary.
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl BarSource for NativeBarSource {
    async fn fetch_bars(
        &self,
        symbol: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRecord>, AppError> {
        match self.fetch_range_primary(symbol, period, start, end).await {
            Ok(records) if records.is_empty() => Err(AppError::NoData),
            Ok(records) => Ok(records),
            Err(AppError::SourceUnavailable(reason)) => {
                warn!(symbol, %reason, "primary kline surface unavailable, trying fallback");
                match self
                    .fetch_range_fallback(symbol, period, start, end)
                    .await
                {
                    Ok(records) if records.is_empty() => Err(AppError::NoData),
                    other => other,
                }
            }
            Err(e) => {
                debug!(symbol, error = %e, "primary kline surface failed, trying fallback");
                match self
                    .fetch_range_fallback(symbol, period, start, end)
                    .await
                {
                    Ok(records) if records.is_empty() => Err(AppError::NoData),
                    other => other,
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

fn classify_reqwest_err(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::SourceTimeout(Duration::from_secs(30))
    } else if e.is_connect() {
        AppError::SourceUnavailable(e.to_string())
    } else {
        AppError::SourceProtocol(e.to_string())
    }
}
