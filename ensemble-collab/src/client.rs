//! WebSocket sync client for one open formation.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - State-vector handshake and delta send/receive
//! - Ack-driven pending-delta tracking (drives "unsaved changes" UX)
//! - Awareness updates with latest-wins cursor backpressure
//!
//! Local edits keep working offline: deltas produced while disconnected
//! sit in the pending set and replay on reconnect, where the document's
//! duplicate suppression makes the replay exactly-once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use ensemble_core::{StampedOp, StateVector};

use crate::presence::AwarenessMessage;
use crate::protocol::{ClientInfo, MessageType, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Handshake sent, outstanding deltas draining.
    Syncing,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Transport established, handshake in flight
    Connected,
    /// Connection lost
    Disconnected,
    /// Received a document delta from a remote client
    RemoteDelta {
        client_id: Uuid,
        clock: u64,
        ops: Vec<StampedOp>,
    },
    /// Handshake diff from the relay; applying it completes the sync
    HandshakeDiff { ops: Vec<StampedOp> },
    /// The relay acknowledged one of our deltas
    DeltaAcked { clock: u64 },
    /// Awareness update from a remote client
    RemoteAwareness { message: AwarenessMessage },
    /// A client joined the room
    PeerJoined(ClientInfo),
    /// A client left the room
    PeerLeft(Uuid),
}

/// Deltas sent (or authored offline) but not yet acknowledged by the relay.
///
/// Entries are retained until their ack arrives, so a reconnect can replay
/// everything in clock order; the document's per-origin duplicate
/// suppression keeps the replay exactly-once.
pub struct PendingDeltas {
    entries: BTreeMap<u64, Vec<u8>>,
    max_size: usize,
}

impl PendingDeltas {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_size,
        }
    }

    /// Track an encoded delta. Returns `false` when the buffer is full.
    pub fn insert(&mut self, clock: u64, encoded: Vec<u8>) -> bool {
        if self.entries.len() >= self.max_size {
            return false;
        }
        self.entries.insert(clock, encoded);
        true
    }

    /// Drop an acknowledged delta.
    pub fn ack(&mut self, clock: u64) -> bool {
        self.entries.remove(&clock).is_some()
    }

    /// All unacked deltas in clock order, for replay on reconnect.
    pub fn replay(&self) -> Vec<(u64, Vec<u8>)> {
        self.entries
            .iter()
            .map(|(clock, data)| (*clock, data.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Exponential backoff schedule for reconnection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `base * 2^attempt`, capped.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// The sync client.
///
/// Manages one WebSocket connection to the relay, the state-vector
/// handshake, delta and awareness traffic, and the pending-delta buffer.
pub struct SyncClient {
    info: ClientInfo,
    doc_id: Uuid,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Send-counter clock; acks reference it.
    clock: Arc<RwLock<u64>>,

    pending: Arc<Mutex<PendingDeltas>>,
    last_synced_at: Arc<RwLock<Option<SystemTime>>>,

    /// Keep-all channel for document and control messages.
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Latest-wins slot for cursor traffic; a slow link drops stale
    /// cursors, never a document delta.
    cursor_tx: Option<watch::Sender<Option<Vec<u8>>>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,

    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(info: ClientInfo, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            info,
            doc_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            pending: Arc::new(Mutex::new(PendingDeltas::new(10_000))),
            last_synced_at: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            cursor_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            reader_task: None,
            writer_task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and run the handshake. Idempotent: a no-op when already
    /// connecting or connected.
    ///
    /// `state_vector` summarizes the local replica so the relay can answer
    /// with exactly the missing ops instead of the whole document.
    pub async fn connect(&mut self, state_vector: StateVector) -> Result<(), ProtocolError> {
        {
            let state = *self.state.read().await;
            if state != ConnectionState::Disconnected {
                return Ok(());
            }
        }
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.doc_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        // A previous connection's tasks must not outlive it.
        self.abort_tasks();

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (cursor_tx, mut cursor_rx) = watch::channel::<Option<Vec<u8>>>(None);
        self.outgoing_tx = Some(out_tx.clone());
        self.cursor_tx = Some(cursor_tx);

        // Writer task: document/control messages keep-all, cursors
        // latest-wins.
        self.writer_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = out_rx.recv() => match msg {
                        Some(data) => {
                            if ws_writer
                                .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    },
                    changed = cursor_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let data = cursor_rx.borrow_and_update().clone();
                        if let Some(data) = data {
                            if ws_writer
                                .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            }
        }));

        // Handshake: announce ourselves, then request the diff.
        let join = SyncMessage::peer_joined(self.doc_id, &self.info)?.encode()?;
        let step1 =
            SyncMessage::sync_step1(self.info.client_id, self.doc_id, &state_vector)?.encode()?;
        out_tx
            .send(join)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        out_tx
            .send(step1)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Syncing;
        // try_send: connect() may run under the facade's client lock, and
        // blocking on a backlogged event channel here could deadlock with
        // the consumer waiting for that lock.
        let _ = self.event_tx.try_send(SyncEvent::Connected);

        // Replay unacked deltas; the relay dedups, so this is loss-free
        // and duplication-free.
        let queued = self.pending.lock().await.replay();
        if !queued.is_empty() {
            log::info!("Replaying {} unacked deltas", queued.len());
            for (_, data) in queued {
                let _ = out_tx.send(data).await;
            }
        }

        // Reader task: decode incoming messages into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let last_synced_at = self.last_synced_at.clone();
        let own_id = self.info.client_id;
        self.reader_task = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode relay message: {e}");
                                continue;
                            }
                        };

                        match sync_msg.msg_type {
                            MessageType::Delta => {
                                if sync_msg.client_id == own_id {
                                    continue; // Own fan-out echo
                                }
                                if let Ok(ops) = sync_msg.ops() {
                                    let _ = event_tx
                                        .send(SyncEvent::RemoteDelta {
                                            client_id: sync_msg.client_id,
                                            clock: sync_msg.clock,
                                            ops,
                                        })
                                        .await;
                                }
                            }
                            MessageType::SyncStep2 => {
                                if let Ok(ops) = sync_msg.ops() {
                                    *state.write().await = ConnectionState::Connected;
                                    let _ =
                                        event_tx.send(SyncEvent::HandshakeDiff { ops }).await;
                                }
                            }
                            MessageType::DeltaAck => {
                                {
                                    let mut p = pending.lock().await;
                                    p.ack(sync_msg.clock);
                                }
                                *last_synced_at.write().await = Some(SystemTime::now());
                                let _ = event_tx
                                    .send(SyncEvent::DeltaAcked {
                                        clock: sync_msg.clock,
                                    })
                                    .await;
                            }
                            MessageType::Awareness => {
                                if sync_msg.client_id == own_id {
                                    continue;
                                }
                                if let Ok(message) = AwarenessMessage::decode(&sync_msg.payload) {
                                    let _ = event_tx
                                        .send(SyncEvent::RemoteAwareness { message })
                                        .await;
                                }
                            }
                            MessageType::PeerJoined => {
                                if sync_msg.client_id == own_id {
                                    continue;
                                }
                                if let Ok(info) = sync_msg.client_info() {
                                    let _ = event_tx.send(SyncEvent::PeerJoined(info)).await;
                                }
                            }
                            MessageType::PeerLeft => {
                                if sync_msg.client_id == own_id {
                                    continue;
                                }
                                let _ =
                                    event_tx.send(SyncEvent::PeerLeft(sync_msg.client_id)).await;
                            }
                            _ => {}
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        Ok(())
    }

    /// Tear the connection down. Idempotent; pending deltas are preserved
    /// for the next connect.
    pub async fn disconnect(&mut self) {
        self.abort_tasks();
        self.outgoing_tx = None;
        self.cursor_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }

    /// Send a document delta; offline it stays pending for replay.
    /// Returns the clock the relay's ack will reference.
    pub async fn send_delta(&self, ops: &[StampedOp]) -> Result<u64, ProtocolError> {
        let clock = {
            let mut c = self.clock.write().await;
            *c += 1;
            *c
        };
        let msg = SyncMessage::delta(self.info.client_id, self.doc_id, clock, ops)?;
        let encoded = msg.encode()?;

        {
            let mut pending = self.pending.lock().await;
            if !pending.insert(clock, encoded.clone()) {
                return Err(ProtocolError::QueueFull);
            }
        }

        let state = *self.state.read().await;
        if matches!(state, ConnectionState::Syncing | ConnectionState::Connected) {
            if let Some(tx) = &self.outgoing_tx {
                // A dead writer just leaves the delta pending for replay.
                let _ = tx.send(encoded).await;
            }
        }

        Ok(clock)
    }

    /// Send an awareness update. Fire-and-forget: silently dropped while
    /// offline, and cursor updates collapse to the latest value.
    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }

        let payload = message
            .encode()
            .map_err(ProtocolError::SerializationError)?;
        let wire = SyncMessage::awareness(self.info.client_id, self.doc_id, payload).encode()?;

        if message.is_cursor() {
            if let Some(tx) = &self.cursor_tx {
                let _ = tx.send(Some(wire));
            }
        } else if let Some(tx) = &self.outgoing_tx {
            tx.send(wire)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Send a heartbeat ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = SyncMessage::ping(self.info.client_id).encode()?;
        if let Some(tx) = &self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// True while any delta is unacknowledged; gates "unsaved changes" UX.
    pub async fn has_pending_changes(&self) -> bool {
        !self.pending.lock().await.is_empty()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn last_synced_at(&self) -> Option<SystemTime> {
        *self.last_synced_at.read().await
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub fn client_info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::{FormationDoc, Op};

    fn client() -> SyncClient {
        let info = ClientInfo::new(Uuid::new_v4(), "TestUser");
        SyncClient::new(info, Uuid::new_v4(), "ws://127.0.0.1:1")
    }

    fn sample_delta() -> Vec<StampedOp> {
        let mut doc = FormationDoc::new(Uuid::new_v4());
        vec![
            doc.apply_local(Op::SetAudioTrack {
                track: Some("t".into()),
            })
            .delta,
        ]
    }

    #[test]
    fn test_client_creation() {
        let c = client();
        assert_eq!(c.client_info().name, "TestUser");
        assert_eq!(c.server_url(), "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let c = client();
        assert_eq!(c.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(c.clock().await, 0);
        assert!(!c.has_pending_changes().await);
        assert!(c.last_synced_at().await.is_none());
    }

    #[tokio::test]
    async fn test_offline_delta_stays_pending() {
        let c = client();
        let ops = sample_delta();

        c.send_delta(&ops).await.unwrap();
        c.send_delta(&ops).await.unwrap();

        assert_eq!(c.pending_len().await, 2);
        assert!(c.has_pending_changes().await);
        assert_eq!(c.clock().await, 2);
    }

    #[tokio::test]
    async fn test_offline_awareness_is_noop() {
        let c = client();
        let msg = AwarenessMessage::Leave {
            client_id: c.client_info().client_id,
        };
        c.send_awareness(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut c = client();
        let err = c.connect(StateVector::default()).await;
        assert!(err.is_err());
        assert_eq!(c.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let mut c = client();
        c.disconnect().await;
        c.disconnect().await;
        assert_eq!(c.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut c = client();
        assert!(c.take_event_rx().is_some());
        assert!(c.take_event_rx().is_none());
    }

    #[test]
    fn test_pending_deltas_replay_order() {
        let mut p = PendingDeltas::new(100);
        p.insert(2, vec![2]);
        p.insert(1, vec![1]);
        p.insert(3, vec![3]);

        let replay = p.replay();
        let clocks: Vec<u64> = replay.iter().map(|(c, _)| *c).collect();
        assert_eq!(clocks, vec![1, 2, 3]);
        // Replay does not consume: entries stay until acked.
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_pending_deltas_ack() {
        let mut p = PendingDeltas::new(100);
        p.insert(1, vec![1, 1]);
        p.insert(2, vec![2, 2]);
        assert_eq!(p.total_bytes(), 4);

        assert!(p.ack(1));
        assert!(!p.ack(1));
        assert_eq!(p.len(), 1);
        assert!(p.ack(2));
        assert!(p.is_empty());
    }

    #[test]
    fn test_pending_deltas_capacity() {
        let mut p = PendingDeltas::new(2);
        assert!(p.insert(1, vec![1]));
        assert!(p.insert(2, vec![2]));
        assert!(!p.insert(3, vec![3]));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        for _ in 0..10 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }
}
