//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── FormationRoom (doc_id) ── FormationDoc ── BroadcastGroup
//! Client B ──┘                                  │
//!                                               ├── DeltaLog (durable seam)
//!                                               │
//!                                    ┌──────────┼───────────┐
//!                                    ▼          ▼           ▼
//!                                 Client A   Client B    Client C
//! ```
//!
//! Each room keeps an authoritative replica of the document, a broadcast
//! group for fan-out, and the append-only delta log. Document deltas are
//! applied, logged, acked, and fanned out; awareness messages are fanned
//! out and discarded — they never touch the document or the log.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use ensemble_core::FormationDoc;

use crate::broadcast::BroadcastGroup;
use crate::delta_log::DeltaLog;
use crate::presence::AwarenessMessage;
use crate::protocol::{ClientInfo, MessageType, SyncMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum clients per room
    pub max_clients_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub logged_deltas: u64,
}

/// One shared formation: authoritative replica + fan-out + durable log.
pub struct FormationRoom {
    doc: Mutex<FormationDoc>,
    log: Mutex<DeltaLog>,
    broadcast: BroadcastGroup,
}

impl FormationRoom {
    fn new(doc_id: Uuid, broadcast_capacity: usize) -> Self {
        Self {
            // The relay replica never authors ops; its id is internal.
            doc: Mutex::new(FormationDoc::new(Uuid::new_v4())),
            log: Mutex::new(DeltaLog::new(doc_id)),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub async fn log_stats(&self) -> crate::delta_log::DeltaLogStats {
        self.log.lock().await.stats()
    }
}

/// Maps document ids to their rooms.
pub struct RoomDirectory {
    rooms: RwLock<HashMap<Uuid, Arc<FormationRoom>>>,
    broadcast_capacity: usize,
}

impl RoomDirectory {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
        }
    }

    /// Get or create the room for a document.
    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<FormationRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        // Slow path: write lock, re-check
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&doc_id) {
            return room.clone();
        }
        let room = Arc::new(FormationRoom::new(doc_id, self.broadcast_capacity));
        rooms.insert(doc_id, room.clone());
        room
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<FormationRoom>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove a room once its last client is gone.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.broadcast.client_count().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    directory: Arc<RoomDirectory>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let directory = Arc::new(RoomDirectory::new(config.broadcast_capacity));
        Self {
            config,
            directory,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Accept WebSocket connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let directory = self.directory.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, directory, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        directory: Arc<RoomDirectory>,
        stats: Arc<RwLock<RelayStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Bound after the first PeerJoined message.
        let mut client_id: Option<Uuid> = None;
        let mut doc_id: Option<Uuid> = None;
        let mut room: Option<Arc<FormationRoom>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::PeerJoined => {
                                    let info = sync_msg.client_info().unwrap_or_else(|_| {
                                        ClientInfo::with_client_id(
                                            sync_msg.client_id,
                                            sync_msg.client_id,
                                            "Anonymous",
                                        )
                                    });

                                    let joined = directory.get_or_create(sync_msg.doc_id).await;
                                    if joined.broadcast.client_count().await
                                        >= config.max_clients_per_room
                                    {
                                        log::warn!(
                                            "Room {} full, refusing {}",
                                            sync_msg.doc_id,
                                            info.name
                                        );
                                        break;
                                    }

                                    client_id = Some(sync_msg.client_id);
                                    doc_id = Some(sync_msg.doc_id);

                                    let rx = joined.broadcast.add_client(info.clone()).await;
                                    broadcast_rx = Some(rx);

                                    // Announce to everyone already in the room.
                                    let join_msg =
                                        SyncMessage::peer_joined(sync_msg.doc_id, &info)?;
                                    let _ = joined.broadcast.broadcast(&join_msg);

                                    room = Some(joined);
                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = directory.room_count().await;
                                    }

                                    log::info!(
                                        "Client {} ({}) joined doc {}",
                                        info.name,
                                        info.client_id,
                                        sync_msg.doc_id
                                    );
                                }

                                MessageType::SyncStep1 => {
                                    if let (Some(r), Some(did)) = (&room, doc_id) {
                                        let diff = match sync_msg.state_vector() {
                                            Ok(sv) => r.doc.lock().await.diff(&sv),
                                            Err(e) => {
                                                log::warn!("Bad state vector from {addr}: {e}");
                                                continue;
                                            }
                                        };
                                        let response =
                                            SyncMessage::sync_step2(Uuid::nil(), did, &diff)?;
                                        let encoded = response.encode()?;
                                        ws_sender.send(Message::Binary(encoded.into())).await?;
                                    }
                                }

                                MessageType::Delta => {
                                    if let (Some(r), Some(did)) = (&room, doc_id) {
                                        let ops = match sync_msg.ops() {
                                            Ok(ops) => ops,
                                            Err(e) => {
                                                log::warn!("Bad delta from {addr}: {e}");
                                                continue;
                                            }
                                        };

                                        let applied =
                                            r.doc.lock().await.apply_remote(&ops);
                                        if applied > 0 {
                                            // Durable log first, fan-out second.
                                            r.log.lock().await.append(
                                                sync_msg.client_id,
                                                sync_msg.clock,
                                                sync_msg.payload.clone(),
                                            );
                                            {
                                                let mut s = stats.write().await;
                                                s.logged_deltas += 1;
                                            }
                                            r.broadcast.broadcast_raw(Arc::new(bytes));
                                        } else {
                                            log::debug!(
                                                "Duplicate delta (clock {}) from {addr}",
                                                sync_msg.clock
                                            );
                                        }

                                        // Ack either way so replays settle.
                                        let ack = SyncMessage::delta_ack(did, sync_msg.clock);
                                        let encoded = ack.encode()?;
                                        ws_sender.send(Message::Binary(encoded.into())).await?;
                                    }
                                }

                                MessageType::Awareness => {
                                    if let (Some(r), Some(did)) = (&room, doc_id) {
                                        // Decode for monitoring only; the payload is
                                        // fanned out verbatim and never persisted.
                                        if let Ok(awareness) =
                                            AwarenessMessage::decode(&sync_msg.payload)
                                        {
                                            match &awareness {
                                                AwarenessMessage::Join { name, .. } => {
                                                    log::info!(
                                                        "Presence: {name} joined room {did}"
                                                    );
                                                }
                                                AwarenessMessage::Leave { client_id } => {
                                                    log::info!(
                                                        "Presence: {client_id} left room {did}"
                                                    );
                                                }
                                                AwarenessMessage::Cursor { .. } => {
                                                    log::trace!(
                                                        "Presence: cursor update in room {did}"
                                                    );
                                                }
                                                AwarenessMessage::Selection {
                                                    client_id,
                                                    performer_ids,
                                                } => {
                                                    log::debug!(
                                                        "Presence: {client_id} selected {} performers in room {did}",
                                                        performer_ids.len()
                                                    );
                                                }
                                                AwarenessMessage::Drag {
                                                    client_id,
                                                    performer_id,
                                                } => {
                                                    log::debug!(
                                                        "Presence: {client_id} dragging {performer_id:?} in room {did}"
                                                    );
                                                }
                                            }
                                        }
                                        r.broadcast.broadcast_raw(Arc::new(bytes));
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(sync_msg.client_id);
                                    let encoded = pong.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Fan-out from the room's broadcast channel
                msg = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not joined yet — wait forever.
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo back to the sender.
                            if let Ok(fan_msg) = SyncMessage::decode(&data) {
                                if Some(fan_msg.client_id) == client_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Client {client_id:?} lagged by {n} messages");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: drop the client; its departure is the presence signal.
        if let (Some(cid), Some(did), Some(r)) = (client_id, doc_id, room) {
            r.broadcast.remove_client(&cid).await;

            let leave_msg = SyncMessage::peer_left(cid, did);
            let _ = r.broadcast.broadcast(&leave_msg);

            if r.broadcast.client_count().await == 0 {
                let log_stats = r.log_stats().await;
                // Hand-off point for durable storage: the room's delta log
                // holds the full accepted history at this moment.
                log::info!(
                    "Room {did} closing with {} logged deltas ({} bytes)",
                    log_stats.entries,
                    log_stats.total_bytes
                );
                directory.remove_if_empty(&did).await;
            }

            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = directory.room_count().await;
        } else {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        Ok(())
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }
}
