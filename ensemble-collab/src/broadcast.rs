//! Fan-out broadcast to N-1 room peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! connection gets an independent receiver buffering up to `capacity`
//! messages; a lagging receiver drops its oldest buffered messages, which
//! is acceptable for presence and recovered for documents by the state
//! vector handshake on the next sync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ClientInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_clients: usize,
}

/// Atomic counters so the hot broadcast path never takes a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
}

/// A broadcast group for a single formation room.
///
/// All clients editing the same document share one channel; a message from
/// any of them fans out to every receiver (senders filter their own echo).
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    clients: Arc<RwLock<HashMap<Uuid, ClientInfo>>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given per-receiver capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            clients: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Add a client; returns its receiver.
    pub async fn add_client(&self, info: ClientInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut clients = self.clients.write().await;
        clients.insert(info.client_id, info);
        self.sender.subscribe()
    }

    /// Remove a client from this group.
    pub async fn remove_client(&self, client_id: &Uuid) -> Option<ClientInfo> {
        let mut clients = self.clients.write().await;
        clients.remove(client_id)
    }

    /// Encode and broadcast a message. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes (zero-copy fast path, lock-free).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn has_client(&self, client_id: &Uuid) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            active_clients: self.clients.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a client (relay-internal taps).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
