//! Subscription index (C9, spec §4.9).
//!
//! Tracks which clients want which `(symbol, period, data_type)` triples.
//! Keyed both ways — by subscription key (for publish fan-out) and by
//! client (for `ClientSubscriptions`/`UnsubscribeAll`) — the same
//! dual-index shape the historical cache uses for its secondary indexes
//! ([`crate::cache`]), so a single `parking_lot::RwLock<HashMap<..>>` pair
//! covers both lookup directions without cross-referencing locks.

use crate::bar::Period;
use crate::error::AppError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const MAX_SUBSCRIPTIONS_PER_CLIENT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub period: Period,
    pub data_type: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Kline,
    Quality,
    Tick,
}

impl DataType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kline" | "bar" => Some(DataType::Kline),
            "quality" => Some(DataType::Quality),
            "tick" => Some(DataType::Tick),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{:?}", self.symbol, self.period, self.data_type)
    }
}

/// Validates the bare wire symbol format (spec §4.9): an A-share 6-digit
/// code prefixed `0`/`3`/`6`, an HK 1-5 digit code, or a US 1-5 letter
/// ticker — the three fixed shapes the original matches with
/// `^(0|3|6)\d{5}$`, `^\d{1,5}$` and `^[A-Z]{1,5}$` respectively, spelled
/// out here rather than pulling in a regex crate for three fixed shapes.
pub fn validate_symbol(symbol: &str) -> Result<(), AppError> {
    let is_a_share = symbol.len() == 6
        && matches!(symbol.as_bytes()[0], b'0' | b'3' | b'6')
        && symbol.bytes().all(|b| b.is_ascii_digit());
    let is_hk = !symbol.is_empty() && symbol.len() <= 5 && symbol.bytes().all(|b| b.is_ascii_digit());
    let is_us =
        !symbol.is_empty() && symbol.len() <= 5 && symbol.bytes().all(|b| b.is_ascii_uppercase());

    if is_a_share || is_hk || is_us {
        Ok(())
    } else {
        Err(AppError::InvalidSymbol(symbol.to_string()))
    }
}

#[derive(Default)]
pub struct SubscriptionIndex {
    by_key: RwLock<HashMap<SubscriptionKey, HashSet<String>>>,
    by_client: RwLock<HashMap<String, HashSet<SubscriptionKey>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: subscribing to an already-held key is a no-op success
    /// (spec §4.9 "duplicate subscribe returns success, not an error").
    pub fn subscribe(&self, client_id: &str, key: SubscriptionKey) -> Result<(), AppError> {
        validate_symbol(&key.symbol)?;

        let mut by_client = self.by_client.write();
        let client_keys = by_client.entry(client_id.to_string()).or_default();
        if client_keys.len() >= MAX_SUBSCRIPTIONS_PER_CLIENT && !client_keys.contains(&key) {
            return Err(AppError::SubscriptionCapReached(MAX_SUBSCRIPTIONS_PER_CLIENT));
        }
        client_keys.insert(key.clone());
        drop(by_client);

        self.by_key
            .write()
            .entry(key)
            .or_default()
            .insert(client_id.to_string());
        Ok(())
    }

    /// Idempotent: unsubscribing from a key the client never held is a
    /// no-op success.
    pub fn unsubscribe(&self, client_id: &str, key: &SubscriptionKey) {
        if let Some(clients) = self.by_key.write().get_mut(key) {
            clients.remove(client_id);
        }
        if let Some(keys) = self.by_client.write().get_mut(client_id) {
            keys.remove(key);
        }
    }

    /// Removes every subscription for `client_id` (spec §4.9
    /// `UnsubscribeAll`, called on disconnect).
    pub fn unsubscribe_all(&self, client_id: &str) {
        let keys = self.by_client.write().remove(client_id).unwrap_or_default();
        let mut by_key = self.by_key.write();
        for key in keys {
            if let Some(clients) = by_key.get_mut(&key) {
                clients.remove(client_id);
            }
        }
    }

    /// Clients subscribed to `key` (spec §4.9 `Subscribers`, used by C12 to
    /// fan out a published bar).
    pub fn subscribers(&self, key: &SubscriptionKey) -> Vec<String> {
        self.by_key
            .read()
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every key `client_id` currently holds (spec §4.9
    /// `ClientSubscriptions`).
    pub fn client_subscriptions(&self, client_id: &str) -> Vec<SubscriptionKey> {
        self.by_client
            .read()
            .get(client_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All distinct subscription keys with at least one subscriber — the
    /// set C12's publish tick iterates each cycle.
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.by_key
            .read()
            .iter()
            .filter(|(_, clients)| !clients.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.by_client.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(symbol: &str) -> SubscriptionKey {
        SubscriptionKey {
            symbol: symbol.to_string(),
            period: Period::D1,
            data_type: DataType::Kline,
        }
    }

    #[test]
    fn duplicate_subscribe_is_idempotent() {
        let idx = SubscriptionIndex::new();
        idx.subscribe("c1", key("600519")).unwrap();
        idx.subscribe("c1", key("600519")).unwrap();
        assert_eq!(idx.client_subscriptions("c1").len(), 1);
    }

    #[test]
    fn invalid_symbol_rejected() {
        let idx = SubscriptionIndex::new();
        let err = idx.subscribe("c1", key("bad symbol")).unwrap_err();
        assert!(matches!(err, AppError::InvalidSymbol(_)));
    }

    #[test]
    fn a_share_hk_and_us_symbols_are_all_valid() {
        assert!(validate_symbol("600519").is_ok());
        assert!(validate_symbol("300750").is_ok());
        assert!(validate_symbol("000001").is_ok());
        assert!(validate_symbol("700").is_ok());
        assert!(validate_symbol("AAPL").is_ok());
        assert!(validate_symbol("T").is_ok());
    }

    #[test]
    fn a_share_prefix_outside_zero_three_six_is_rejected() {
        assert!(validate_symbol("900001").is_err());
    }

    #[test]
    fn unsubscribe_all_clears_reverse_index() {
        let idx = SubscriptionIndex::new();
        idx.subscribe("c1", key("600519")).unwrap();
        idx.subscribe("c1", key("000001")).unwrap();
        idx.unsubscribe_all("c1");
        assert!(idx.client_subscriptions("c1").is_empty());
        assert!(idx.subscribers(&key("600519")).is_empty());
    }

    #[test]
    fn cap_rejects_beyond_limit() {
        let idx = SubscriptionIndex::new();
        for i in 0..MAX_SUBSCRIPTIONS_PER_CLIENT {
            idx.subscribe("c1", key(&format!("{i:05}"))).unwrap();
        }
        let err = idx.subscribe("c1", key("OVER")).unwrap_err();
        assert!(matches!(err, AppError::SubscriptionCapReached(_)));
    }
}
