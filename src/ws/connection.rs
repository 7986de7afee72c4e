//! Connection manager (C10, spec §4.10).
//!
//! Each connected client gets a bounded outbound channel; a full channel
//! means the client is falling behind and its oldest-pending frame is
//! shed rather than blocking the publisher (spec §4.10 "backpressure
//! sheds, never blocks"). The registry shape (`RwLock<HashMap<ClientId,
//! Handle>>`, `Connect`/`Disconnect`/`Send`/`Broadcast`) generalizes the
//! teacher's single-channel broadcast WS handler (`main.rs::handle_socket`,
//! `broadcast::Sender<WsServerEvent>`) to a per-client addressable registry,
//! since spec's publisher needs to target individual subscriber sets
//! rather than "every connected client".

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct ClientHandle {
    tx: mpsc::Sender<Vec<u8>>,
    state: ConnectionState,
    dropped_frames: u64,
}

#[derive(Default)]
pub struct ConnectionManager {
    clients: RwLock<HashMap<String, ClientHandle>>,
    total_connects: AtomicU64,
    total_disconnects: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new client and returns the receiving half the WS
    /// handler task drains into the socket.
    pub fn connect(&self, client_id: String) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        self.clients.write().insert(
            client_id,
            ClientHandle {
                tx,
                state: ConnectionState::Open,
                dropped_frames: 0,
            },
        );
        self.total_connects.fetch_add(1, Ordering::Relaxed);
        rx
    }

    pub fn disconnect(&self, client_id: &str) {
        if let Some(mut handle) = self.clients.write().remove(client_id) {
            handle.state = ConnectionState::Closed;
            self.total_disconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Best-effort send; on a full queue the frame is dropped rather than
    /// applying backpressure to the publisher loop (spec §4.10).
    pub fn send(&self, client_id: &str, frame: Vec<u8>) -> bool {
        let clients = self.clients.read();
        let Some(handle) = clients.get(client_id) else {
            return false;
        };
        match handle.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Sends to every client in `client_ids`; returns how many succeeded.
    pub fn broadcast(&self, client_ids: &[String], frame: Arc<Vec<u8>>) -> usize {
        client_ids
            .iter()
            .filter(|id| self.send(id, (*frame).clone()))
            .count()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> (u64, u64, usize) {
        (
            self.total_connects.load(Ordering::Relaxed),
            self.total_disconnects.load(Ordering::Relaxed),
            self.connection_count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_then_send_delivers_frame() {
        let manager = ConnectionManager::new();
        let mut rx = manager.connect("c1".to_string());
        assert!(manager.send("c1", b"hello".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), b"hello".to_vec());
    }

    #[test]
    fn send_to_unknown_client_is_false() {
        let manager = ConnectionManager::new();
        assert!(!manager.send("ghost", b"x".to_vec()));
    }

    #[test]
    fn disconnect_removes_client() {
        let manager = ConnectionManager::new();
        manager.connect("c1".to_string());
        manager.disconnect("c1");
        assert!(!manager.is_connected("c1"));
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn full_queue_drops_rather_than_blocks() {
        let manager = ConnectionManager::new();
        let _rx = manager.connect("c1".to_string());
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            assert!(manager.send("c1", b"x".to_vec()));
        }
        assert!(!manager.send("c1", b"overflow".to_vec()));
    }
}
