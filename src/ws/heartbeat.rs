//! Heartbeat & reconnect supervisor (C13, spec §4.13 connection half).
//!
//! Ping cadence and the use of an `interval` ticker alongside message
//! processing in the same `tokio::select!` loop mirrors the upstream
//! market-WS ping (teacher: `scrapers/polymarket_ws.rs`, 5s interval,
//! `MissedTickBehavior::Skip` not used there but added here since a
//! stalled publish tick shouldn't pile up catch-up pings). Generalized
//! from "ping the single upstream connection" to "ping every connected
//! client and track missed pongs per client".

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

const MISSED_PING_LIMIT: u32 = 3;
/// Grace period after a client is declared lost during which the same
/// client_id may reconnect and resume its subscriptions (spec §4.13
/// "optional reconnect window").
pub const RECONNECT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy)]
struct ClientHeartbeat {
    last_pong: Instant,
    missed: u32,
}

pub struct HeartbeatSupervisor {
    clients: RwLock<HashMap<String, ClientHeartbeat>>,
    lost_at: RwLock<HashMap<String, Instant>>,
    ping_interval: Duration,
}

impl HeartbeatSupervisor {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            lost_at: RwLock::new(HashMap::new()),
            ping_interval,
        }
    }

    pub fn register(&self, client_id: &str) {
        self.clients.write().insert(
            client_id.to_string(),
            ClientHeartbeat { last_pong: Instant::now(), missed: 0 },
        );
        self.lost_at.write().remove(client_id);
    }

    pub fn forget(&self, client_id: &str) {
        self.clients.write().remove(client_id);
    }

    pub fn record_pong(&self, client_id: &str) {
        if let Some(hb) = self.clients.write().get_mut(client_id) {
            hb.last_pong = Instant::now();
            hb.missed = 0;
        }
    }

    /// Called once per ping tick for every connected client; returns the
    /// set of clients whose missed-ping count just crossed the limit
    /// (caller should close their sockets and call [`Self::mark_lost`]).
    pub fn sweep_missed(&self, connected: &[String]) -> Vec<String> {
        let mut lost = Vec::new();
        let mut clients = self.clients.write();
        for client_id in connected {
            let hb = clients
                .entry(client_id.clone())
                .or_insert(ClientHeartbeat { last_pong: Instant::now(), missed: 0 });
            hb.missed += 1;
            if hb.missed >= MISSED_PING_LIMIT {
                lost.push(client_id.clone());
            }
        }
        lost
    }

    pub fn mark_lost(&self, client_id: &str) {
        self.clients.write().remove(client_id);
        self.lost_at.write().insert(client_id.to_string(), Instant::now());
        info!(client_id, "connection marked lost, reconnect window open");
    }

    /// True if `client_id` was recently lost and is still inside the
    /// reconnect grace window (caller can decide to restore its prior
    /// subscriptions instead of starting fresh).
    pub fn within_reconnect_window(&self, client_id: &str) -> bool {
        self.lost_at
            .read()
            .get(client_id)
            .map(|at| at.elapsed() < RECONNECT_WINDOW)
            .unwrap_or(false)
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }
}

/// Drives the ping ticker; `on_tick` is called with the supervisor on
/// every tick so the caller can fetch `sweep_missed` against its live
/// connection list and push ping frames (kept out of this module since
/// it needs the connection manager and codec).
pub async fn run_ping_ticker<F>(supervisor: Arc<HeartbeatSupervisor>, mut on_tick: F)
where
    F: FnMut(&HeartbeatSupervisor),
{
    let mut ticker = interval(supervisor.ping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        on_tick(&supervisor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missed_pings_accumulate_and_trip_at_limit() {
        let sup = HeartbeatSupervisor::new(Duration::from_secs(5));
        sup.register("c1");
        let connected = vec!["c1".to_string()];
        assert!(sup.sweep_missed(&connected).is_empty());
        assert!(sup.sweep_missed(&connected).is_empty());
        let lost = sup.sweep_missed(&connected);
        assert_eq!(lost, vec!["c1".to_string()]);
    }

    #[test]
    fn pong_resets_missed_counter() {
        let sup = HeartbeatSupervisor::new(Duration::from_secs(5));
        sup.register("c1");
        let connected = vec!["c1".to_string()];
        sup.sweep_missed(&connected);
        sup.sweep_missed(&connected);
        sup.record_pong("c1");
        assert!(sup.sweep_missed(&connected).is_empty());
    }

    #[test]
    fn reconnect_window_open_right_after_loss() {
        let sup = HeartbeatSupervisor::new(Duration::from_secs(5));
        sup.register("c1");
        sup.mark_lost("c1");
        assert!(sup.within_reconnect_window("c1"));
        assert!(!sup.within_reconnect_window("c2"));
    }
}
