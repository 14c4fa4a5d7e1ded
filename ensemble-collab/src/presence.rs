//! Ephemeral presence: cursors, selections, and drag intent.
//!
//! Presence is a parallel channel to document sync, never part of it: no
//! presence message reaches the document, the undo stacks, or the relay's
//! durable delta log. Records live exactly as long as their connection —
//! the relay's `PeerLeft` fan-out is the departure signal, not a
//! client-side heartbeat timeout.
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()
//!       │  (rate-limited: 30fps)
//!       ▼
//! AwarenessMessage::Cursor { … }
//!       │
//!       ▼   (WebSocket broadcast, fan-out and forget)
//! Remote PresenceRoom::handle_message()
//! ```
//!
//! The drag lock layered on top is advisory coordination, not mutual
//! exclusion: two clients racing inside one broadcast interval can both
//! "hold" it, and the document's LWW position merge settles the data
//! either way.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::ClientInfo;

/// 2D cursor position in stage coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// RGBA presence color.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresenceColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl PresenceColor {
    /// Derive a stable, visually distinct color from a user id.
    ///
    /// Every client runs the same derivation, so a user renders the same
    /// color in every session without any coordination.
    pub fn from_user(user_id: Uuid) -> Self {
        let hash = user_id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let saturation = 0.7;
        let lightness = 0.6;

        let (r, g, b) = hsl_to_rgb(hue, saturation, lightness);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Awareness messages carried inside `SyncMessage::Awareness` payloads.
///
/// Cursor updates are high-frequency and throttled; join/leave, selection
/// and drag changes broadcast immediately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Announce the local client with its user profile.
    Join {
        client_id: Uuid,
        user_id: Uuid,
        name: String,
        avatar: Option<String>,
        color: PresenceColor,
    },

    /// Clean departure (the relay also synthesizes this on disconnect).
    Leave { client_id: Uuid },

    /// Cursor moved or cleared (`None`).
    Cursor {
        client_id: Uuid,
        position: Option<Vec2>,
        /// Monotonic per-sender counter; stale updates are dropped.
        timestamp: u64,
    },

    /// Selection changed.
    Selection {
        client_id: Uuid,
        performer_ids: Vec<Uuid>,
    },

    /// Drag started (`Some(id)`) or ended (`None`).
    Drag {
        client_id: Uuid,
        performer_id: Option<Uuid>,
    },
}

impl AwarenessMessage {
    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    /// Get the client_id from any variant.
    pub fn client_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { client_id, .. } => *client_id,
            AwarenessMessage::Leave { client_id } => *client_id,
            AwarenessMessage::Cursor { client_id, .. } => *client_id,
            AwarenessMessage::Selection { client_id, .. } => *client_id,
            AwarenessMessage::Drag { client_id, .. } => *client_id,
        }
    }

    /// True for the lossy-tolerant, latest-wins cursor traffic.
    pub fn is_cursor(&self) -> bool {
        matches!(self, AwarenessMessage::Cursor { .. })
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote presence records
// ───────────────────────────────────────────────────────────────────

/// One remote client's presence as tracked locally.
#[derive(Debug, Clone)]
pub struct PresenceState {
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
    pub color: PresenceColor,
    pub cursor: Option<Vec2>,
    pub selected_performer_ids: Vec<Uuid>,
    pub dragging_performer_id: Option<Uuid>,
    /// Last cursor timestamp seen (stale-update rejection).
    last_cursor_timestamp: u64,
}

impl PresenceState {
    fn new(client_id: Uuid, user_id: Uuid, name: String, color: PresenceColor) -> Self {
        Self {
            client_id,
            user_id,
            name,
            avatar: None,
            color,
            cursor: None,
            selected_performer_ids: Vec::new(),
            dragging_performer_id: None,
            last_cursor_timestamp: 0,
        }
    }

    fn update_cursor(&mut self, position: Option<Vec2>, timestamp: u64) {
        if timestamp < self.last_cursor_timestamp {
            return; // Stale
        }
        self.cursor = position;
        self.last_cursor_timestamp = timestamp;
    }
}

/// Verdict of drag-lock arbitration.
#[derive(Debug, Clone, PartialEq)]
pub struct DragVerdict {
    pub allowed: bool,
    /// Display name of the blocking client, when blocked.
    pub blocked_by: Option<String>,
}

impl DragVerdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            blocked_by: None,
        }
    }

    pub fn blocked_by(name: impl Into<String>) -> Self {
        Self {
            allowed: false,
            blocked_by: Some(name.into()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33); // 30fps

/// Tracks all remote clients' presence and produces the local client's
/// outgoing awareness messages.
pub struct PresenceRoom {
    local: ClientInfo,
    local_color: PresenceColor,
    peers: HashMap<Uuid, PresenceState>,

    /// Rate limiter: last time a cursor update was broadcast.
    last_cursor_broadcast: Instant,
    cursor_broadcast_interval: Duration,

    local_cursor: Option<Vec2>,
    local_selection: Vec<Uuid>,
    local_dragging: Option<Uuid>,

    /// Monotonic counter stamped on outgoing cursor messages.
    timestamp_counter: u64,
}

impl PresenceRoom {
    pub fn new(local: ClientInfo) -> Self {
        let local_color = PresenceColor::from_user(local.user_id);
        Self {
            local,
            local_color,
            peers: HashMap::new(),
            // Allow an immediate first broadcast.
            last_cursor_broadcast: Instant::now() - Duration::from_secs(1),
            cursor_broadcast_interval: CURSOR_BROADCAST_INTERVAL,
            local_cursor: None,
            local_selection: Vec::new(),
            local_dragging: None,
            timestamp_counter: 0,
        }
    }

    /// Create with custom broadcast interval (for testing).
    pub fn with_interval(local: ClientInfo, interval: Duration) -> Self {
        let mut room = Self::new(local);
        room.cursor_broadcast_interval = interval;
        room
    }

    /// Handle an incoming awareness message from the network.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) {
        // Ignore our own fan-out echo
        if msg.client_id() == self.local.client_id {
            return;
        }

        match msg {
            AwarenessMessage::Join {
                client_id,
                user_id,
                name,
                avatar,
                color,
            } => {
                let mut state = PresenceState::new(*client_id, *user_id, name.clone(), *color);
                state.avatar = avatar.clone();
                self.peers.insert(*client_id, state);
            }

            AwarenessMessage::Leave { client_id } => {
                self.peers.remove(client_id);
            }

            AwarenessMessage::Cursor {
                client_id,
                position,
                timestamp,
            } => {
                let peer = self.peers.entry(*client_id).or_insert_with(|| {
                    // Cursor from a client whose Join we missed (it joined
                    // before we connected) — track it under a placeholder
                    // profile until a Join arrives.
                    PresenceState::new(
                        *client_id,
                        *client_id,
                        format!("Guest-{}", &client_id.to_string()[..8]),
                        PresenceColor::from_user(*client_id),
                    )
                });
                peer.update_cursor(*position, *timestamp);
            }

            AwarenessMessage::Selection {
                client_id,
                performer_ids,
            } => {
                if let Some(peer) = self.peers.get_mut(client_id) {
                    peer.selected_performer_ids = performer_ids.clone();
                }
            }

            AwarenessMessage::Drag {
                client_id,
                performer_id,
            } => {
                if let Some(peer) = self.peers.get_mut(client_id) {
                    peer.dragging_performer_id = *performer_id;
                }
            }
        }
    }

    /// Seed a remote record from transport-level roster info, ahead of any
    /// awareness traffic from that client. No-op for known peers.
    pub fn register_client(&mut self, info: &ClientInfo) {
        if info.client_id == self.local.client_id || self.peers.contains_key(&info.client_id) {
            return;
        }
        let mut state = PresenceState::new(
            info.client_id,
            info.user_id,
            info.name.clone(),
            PresenceColor::from_user(info.user_id),
        );
        state.avatar = info.avatar.clone();
        self.peers.insert(info.client_id, state);
    }

    /// Drop a remote record on transport-level departure. Releases any drag
    /// lock the client held.
    pub fn remove_peer(&mut self, client_id: Uuid) -> Option<PresenceState> {
        self.peers.remove(&client_id)
    }

    /// Drop every remote record (session teardown / reconnect re-sync).
    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }

    // ── Local state → outgoing messages ─────────────────────────────

    /// Announce the local client.
    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            client_id: self.local.client_id,
            user_id: self.local.user_id,
            name: self.local.name.clone(),
            avatar: self.local.avatar.clone(),
            color: self.local_color,
        }
    }

    /// Clean local departure.
    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            client_id: self.local.client_id,
        }
    }

    /// Move the local cursor. Returns a message only when the throttle
    /// window has elapsed; dropped updates are fine (latest wins).
    pub fn update_local_cursor(&mut self, position: Vec2) -> Option<AwarenessMessage> {
        self.local_cursor = Some(position);

        if self.last_cursor_broadcast.elapsed() < self.cursor_broadcast_interval {
            return None; // Throttled
        }

        self.timestamp_counter += 1;
        self.last_cursor_broadcast = Instant::now();

        Some(AwarenessMessage::Cursor {
            client_id: self.local.client_id,
            position: Some(position),
            timestamp: self.timestamp_counter,
        })
    }

    /// Clear the local cursor (pointer left the stage). Never throttled.
    pub fn clear_cursor(&mut self) -> AwarenessMessage {
        self.local_cursor = None;
        self.timestamp_counter += 1;
        AwarenessMessage::Cursor {
            client_id: self.local.client_id,
            position: None,
            timestamp: self.timestamp_counter,
        }
    }

    /// Replace the local selection.
    pub fn set_selected_performers(&mut self, performer_ids: Vec<Uuid>) -> AwarenessMessage {
        self.local_selection = performer_ids.clone();
        AwarenessMessage::Selection {
            client_id: self.local.client_id,
            performer_ids,
        }
    }

    /// Set or clear the local drag target.
    pub fn set_dragging(&mut self, performer_id: Option<Uuid>) -> AwarenessMessage {
        self.local_dragging = performer_id;
        AwarenessMessage::Drag {
            client_id: self.local.client_id,
            performer_id,
        }
    }

    // ── Drag-lock arbitration ───────────────────────────────────────

    /// Who, if anyone, is dragging this performer right now.
    pub fn is_performer_being_dragged(&self, performer_id: Uuid) -> Option<&PresenceState> {
        self.peers
            .values()
            .find(|p| p.dragging_performer_id == Some(performer_id))
    }

    /// Advisory check before a local drag. Not a correctness guarantee:
    /// the document merge resolves whatever slips through the race window.
    pub fn can_move_performer(&self, performer_id: Uuid) -> DragVerdict {
        match self.is_performer_being_dragged(performer_id) {
            Some(holder) => DragVerdict::blocked_by(holder.name.clone()),
            None => DragVerdict::allowed(),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn local_client_id(&self) -> Uuid {
        self.local.client_id
    }

    pub fn local_color(&self) -> PresenceColor {
        self.local_color
    }

    pub fn local_cursor(&self) -> Option<Vec2> {
        self.local_cursor
    }

    pub fn local_selection(&self) -> &[Uuid] {
        &self.local_selection
    }

    pub fn local_dragging(&self) -> Option<Uuid> {
        self.local_dragging
    }

    pub fn peer(&self, client_id: &Uuid) -> Option<&PresenceState> {
        self.peers.get(client_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PresenceState> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn info(name: &str) -> ClientInfo {
        ClientInfo::new(Uuid::new_v4(), name)
    }

    fn join_msg(client: &ClientInfo) -> AwarenessMessage {
        AwarenessMessage::Join {
            client_id: client.client_id,
            user_id: client.user_id,
            name: client.name.clone(),
            avatar: None,
            color: PresenceColor::from_user(client.user_id),
        }
    }

    // ── Color derivation ─────────────────────────────────────────

    #[test]
    fn test_color_stable_across_sessions() {
        let user = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            PresenceColor::from_user(user),
            PresenceColor::from_user(user)
        );
    }

    #[test]
    fn test_color_components_valid() {
        let c = PresenceColor::from_user(Uuid::new_v4());
        for v in c.to_array() {
            assert!((0.0..=1.0).contains(&v));
        }
        assert_eq!(c.a, 1.0);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    // ── Message encoding ─────────────────────────────────────────

    #[test]
    fn test_awareness_roundtrip_all_variants() {
        let client = Uuid::new_v4();
        let messages = vec![
            AwarenessMessage::Join {
                client_id: client,
                user_id: Uuid::new_v4(),
                name: "Alice".into(),
                avatar: Some("a.png".into()),
                color: PresenceColor::rgba(0.1, 0.2, 0.3, 1.0),
            },
            AwarenessMessage::Leave { client_id: client },
            AwarenessMessage::Cursor {
                client_id: client,
                position: Some(Vec2::new(10.5, 20.25)),
                timestamp: 42,
            },
            AwarenessMessage::Selection {
                client_id: client,
                performer_ids: vec![Uuid::new_v4()],
            },
            AwarenessMessage::Drag {
                client_id: client,
                performer_id: Some(Uuid::new_v4()),
            },
        ];

        for msg in messages {
            let decoded = AwarenessMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(decoded.client_id(), client);
        }
    }

    #[test]
    fn test_cursor_message_size() {
        let msg = AwarenessMessage::Cursor {
            client_id: Uuid::new_v4(),
            position: Some(Vec2::new(100.0, 200.0)),
            timestamp: 1,
        };
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 50,
            "Cursor message too large: {} bytes",
            encoded.len()
        );
    }

    // ── Room: roster ─────────────────────────────────────────────

    #[test]
    fn test_room_join_and_leave() {
        let mut room = PresenceRoom::new(info("Local"));
        let remote = info("Bob");

        room.handle_message(&join_msg(&remote));
        assert_eq!(room.peer_count(), 1);
        assert_eq!(room.peer(&remote.client_id).unwrap().name, "Bob");

        room.handle_message(&AwarenessMessage::Leave {
            client_id: remote.client_id,
        });
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_room_ignores_own_echo() {
        let local = info("Local");
        let mut room = PresenceRoom::new(local.clone());
        room.handle_message(&join_msg(&local));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_cursor_from_unknown_peer_creates_placeholder() {
        let mut room = PresenceRoom::new(info("Local"));
        let unknown = Uuid::new_v4();

        room.handle_message(&AwarenessMessage::Cursor {
            client_id: unknown,
            position: Some(Vec2::new(5.0, 6.0)),
            timestamp: 1,
        });

        let peer = room.peer(&unknown).unwrap();
        assert_eq!(peer.cursor, Some(Vec2::new(5.0, 6.0)));
        assert!(peer.name.starts_with("Guest-"));
    }

    #[test]
    fn test_stale_cursor_rejected() {
        let mut room = PresenceRoom::new(info("Local"));
        let remote = info("Bob");
        room.handle_message(&join_msg(&remote));

        room.handle_message(&AwarenessMessage::Cursor {
            client_id: remote.client_id,
            position: Some(Vec2::new(10.0, 10.0)),
            timestamp: 5,
        });
        room.handle_message(&AwarenessMessage::Cursor {
            client_id: remote.client_id,
            position: Some(Vec2::new(0.0, 0.0)),
            timestamp: 3, // stale
        });

        assert_eq!(
            room.peer(&remote.client_id).unwrap().cursor,
            Some(Vec2::new(10.0, 10.0))
        );
    }

    // ── Room: local broadcasts ───────────────────────────────────

    #[test]
    fn test_cursor_throttling() {
        let mut room = PresenceRoom::with_interval(info("Local"), Duration::from_millis(33));

        assert!(room.update_local_cursor(Vec2::new(1.0, 1.0)).is_some());
        // Immediate second update is throttled but still tracked locally.
        assert!(room.update_local_cursor(Vec2::new(2.0, 2.0)).is_none());
        assert_eq!(room.local_cursor(), Some(Vec2::new(2.0, 2.0)));
    }

    #[test]
    fn test_cursor_after_interval() {
        let mut room = PresenceRoom::with_interval(info("Local"), Duration::from_millis(5));
        let _ = room.update_local_cursor(Vec2::new(1.0, 1.0));
        thread::sleep(Duration::from_millis(10));
        assert!(room.update_local_cursor(Vec2::new(2.0, 2.0)).is_some());
    }

    #[test]
    fn test_clear_cursor_not_throttled() {
        let mut room = PresenceRoom::new(info("Local"));
        let _ = room.update_local_cursor(Vec2::new(1.0, 1.0));
        let msg = room.clear_cursor();
        match msg {
            AwarenessMessage::Cursor { position, .. } => assert!(position.is_none()),
            _ => panic!("Expected Cursor message"),
        }
        assert!(room.local_cursor().is_none());
    }

    #[test]
    fn test_cursor_timestamps_monotonic() {
        let mut room = PresenceRoom::with_interval(info("Local"), Duration::from_millis(0));
        let m1 = room.update_local_cursor(Vec2::new(1.0, 1.0)).unwrap();
        let m2 = room.update_local_cursor(Vec2::new(2.0, 2.0)).unwrap();
        match (m1, m2) {
            (
                AwarenessMessage::Cursor { timestamp: t1, .. },
                AwarenessMessage::Cursor { timestamp: t2, .. },
            ) => assert!(t2 > t1),
            _ => panic!("Expected Cursor messages"),
        }
    }

    #[test]
    fn test_selection_broadcast() {
        let mut room = PresenceRoom::new(info("Local"));
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let msg = room.set_selected_performers(ids.clone());
        match msg {
            AwarenessMessage::Selection { performer_ids, .. } => assert_eq!(performer_ids, ids),
            _ => panic!("Expected Selection message"),
        }
        assert_eq!(room.local_selection(), &ids[..]);
    }

    // ── Drag-lock arbitration ────────────────────────────────────

    #[test]
    fn test_can_move_unclaimed_performer() {
        let room = PresenceRoom::new(info("Local"));
        assert!(room.can_move_performer(Uuid::new_v4()).allowed);
    }

    #[test]
    fn test_blocked_while_remote_drags() {
        let mut room = PresenceRoom::new(info("Local"));
        let remote = info("Bob");
        let performer = Uuid::new_v4();

        room.handle_message(&join_msg(&remote));
        room.handle_message(&AwarenessMessage::Drag {
            client_id: remote.client_id,
            performer_id: Some(performer),
        });

        let verdict = room.can_move_performer(performer);
        assert!(!verdict.allowed);
        assert_eq!(verdict.blocked_by.as_deref(), Some("Bob"));

        // A different performer is still free.
        assert!(room.can_move_performer(Uuid::new_v4()).allowed);
    }

    #[test]
    fn test_lock_released_on_end_drag() {
        let mut room = PresenceRoom::new(info("Local"));
        let remote = info("Bob");
        let performer = Uuid::new_v4();

        room.handle_message(&join_msg(&remote));
        room.handle_message(&AwarenessMessage::Drag {
            client_id: remote.client_id,
            performer_id: Some(performer),
        });
        assert!(!room.can_move_performer(performer).allowed);

        room.handle_message(&AwarenessMessage::Drag {
            client_id: remote.client_id,
            performer_id: None,
        });
        assert!(room.can_move_performer(performer).allowed);
    }

    #[test]
    fn test_lock_released_on_disconnect() {
        let mut room = PresenceRoom::new(info("Local"));
        let remote = info("Bob");
        let performer = Uuid::new_v4();

        room.handle_message(&join_msg(&remote));
        room.handle_message(&AwarenessMessage::Drag {
            client_id: remote.client_id,
            performer_id: Some(performer),
        });
        assert!(!room.can_move_performer(performer).allowed);

        // Transport-level departure removes the record and the lock.
        room.remove_peer(remote.client_id);
        assert!(room.can_move_performer(performer).allowed);
    }

    #[test]
    fn test_local_drag_state() {
        let mut room = PresenceRoom::new(info("Local"));
        let performer = Uuid::new_v4();

        let msg = room.set_dragging(Some(performer));
        match msg {
            AwarenessMessage::Drag { performer_id, .. } => {
                assert_eq!(performer_id, Some(performer))
            }
            _ => panic!("Expected Drag message"),
        }
        assert_eq!(room.local_dragging(), Some(performer));

        room.set_dragging(None);
        assert!(room.local_dragging().is_none());
    }

    #[test]
    fn test_local_drag_does_not_block_self() {
        // Arbitration only checks *other* clients' records.
        let mut room = PresenceRoom::new(info("Local"));
        let performer = Uuid::new_v4();
        room.set_dragging(Some(performer));
        assert!(room.can_move_performer(performer).allowed);
    }
}
