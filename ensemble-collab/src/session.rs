//! The collaboration facade: the one surface UI code may depend on.
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!  UI mutations ───► │        CollabSession         │
//!  UI reads     ◄─── │                              │
//!                    │  FormationDoc  UndoManager   │
//!                    │  PresenceRoom  SyncClient    │
//!                    └──────┬────────────────▲──────┘
//!                           │ deltas         │ events
//!                           ▼                │
//!                        relay (WebSocket)───┘
//! ```
//!
//! One session per open formation. All writes funnel through the session's
//! mutation API (sole writer); reads hand out plain snapshots. Two
//! background tasks run per session: the event pump (applies remote deltas
//! and presence, tracks sync state) and the reconnect supervisor
//! (exponential backoff, replays the handshake on every reconnect). Both
//! are aborted on teardown, which is the only terminal state — connection
//! loss merely degrades to background retries and an indicator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use ensemble_core::{
    FormationDoc, FormationSnapshot, KeyframePatch, Op, PerformerPatch, PerformerRecord,
    Position, StampedOp, UndoManager,
};

use crate::client::{Backoff, SyncClient, SyncEvent};
use crate::presence::{DragVerdict, PresenceRoom, PresenceState, Vec2};
use crate::protocol::{ClientInfo, ProtocolError};

/// Facade lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Torn down (or never opened); mutation calls fail loudly.
    Uninitialized,
    Connecting,
    Syncing,
    Connected,
    Disconnected,
}

/// Local user identity, as supplied by the identity provider.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
}

impl UserProfile {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            avatar: None,
        }
    }
}

/// Session construction parameters.
pub struct SessionConfig {
    pub relay_url: String,
    pub doc_id: Uuid,
    pub user: UserProfile,
    /// Optional hydration snapshot for fast first paint; merged as just
    /// another replica state, never specially trusted.
    pub initial: Option<Vec<StampedOp>>,
    pub undo_depth: usize,
}

impl SessionConfig {
    pub fn new(relay_url: impl Into<String>, doc_id: Uuid, user: UserProfile) -> Self {
        Self {
            relay_url: relay_url.into(),
            doc_id,
            user,
            initial: None,
            undo_depth: 256,
        }
    }

    pub fn with_initial(mut self, initial: Vec<StampedOp>) -> Self {
        self.initial = Some(initial);
        self
    }
}

/// Facade errors. Transport trouble is state, not an error; only local
/// API misuse fails loudly.
#[derive(Debug)]
pub enum SessionError {
    /// Mutation attempted on a torn-down session — an integration bug.
    NotInitialized,
    Transport(ProtocolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "Session is not initialized"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One collaborative editing session over one formation document.
pub struct CollabSession {
    info: ClientInfo,
    doc: Arc<Mutex<FormationDoc>>,
    undo: Arc<Mutex<UndoManager>>,
    presence: Arc<Mutex<PresenceRoom>>,
    client: Arc<Mutex<SyncClient>>,
    state: Arc<RwLock<SessionState>>,
    active: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CollabSession {
    /// Open a session: hydrate the local replica, spawn the event pump and
    /// the reconnect supervisor, and start connecting in the background.
    ///
    /// Returns immediately — edits work offline-optimistically from the
    /// first moment, whatever the relay is doing.
    pub async fn open(config: SessionConfig) -> Self {
        let info = ClientInfo {
            client_id: Uuid::new_v4(),
            user_id: config.user.id,
            name: config.user.name.clone(),
            avatar: config.user.avatar.clone(),
        };

        let mut doc = FormationDoc::new(info.client_id);
        if let Some(initial) = &config.initial {
            doc.apply_remote(initial);
        }

        let mut sync_client = SyncClient::new(info.clone(), config.doc_id, config.relay_url);
        let events = sync_client
            .take_event_rx()
            .expect("event receiver taken from a fresh client");

        let doc = Arc::new(Mutex::new(doc));
        let undo = Arc::new(Mutex::new(UndoManager::new(config.undo_depth)));
        let presence = Arc::new(Mutex::new(PresenceRoom::new(info.clone())));
        let client = Arc::new(Mutex::new(sync_client));
        let state = Arc::new(RwLock::new(SessionState::Connecting));
        let active = Arc::new(AtomicBool::new(true));

        let (reconnect_tx, reconnect_rx) = mpsc::channel::<()>(4);

        let pump = tokio::spawn(Self::event_pump(
            events,
            doc.clone(),
            presence.clone(),
            client.clone(),
            state.clone(),
            reconnect_tx,
        ));
        let supervisor = tokio::spawn(Self::reconnect_supervisor(
            reconnect_rx,
            doc.clone(),
            client.clone(),
            state.clone(),
            active.clone(),
        ));

        Self {
            info,
            doc,
            undo,
            presence,
            client,
            state,
            active,
            tasks: vec![pump, supervisor],
        }
    }

    async fn event_pump(
        mut events: mpsc::Receiver<SyncEvent>,
        doc: Arc<Mutex<FormationDoc>>,
        presence: Arc<Mutex<PresenceRoom>>,
        client: Arc<Mutex<SyncClient>>,
        state: Arc<RwLock<SessionState>>,
        reconnect_tx: mpsc::Sender<()>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::Connected => {
                    *state.write().await = SessionState::Syncing;
                }

                SyncEvent::HandshakeDiff { ops } => {
                    doc.lock().await.apply_remote(&ops);
                    *state.write().await = SessionState::Connected;

                    // (Re)announce presence after every handshake; the
                    // roster rebuilds from live traffic.
                    let announcements = {
                        let mut p = presence.lock().await;
                        p.clear_peers();
                        let mut msgs = vec![p.join_message()];
                        let selection = p.local_selection().to_vec();
                        if !selection.is_empty() {
                            msgs.push(p.set_selected_performers(selection));
                        }
                        if let Some(dragging) = p.local_dragging() {
                            msgs.push(p.set_dragging(Some(dragging)));
                        }
                        msgs
                    };
                    let c = client.lock().await;
                    for msg in &announcements {
                        let _ = c.send_awareness(msg).await;
                    }
                }

                SyncEvent::RemoteDelta { ops, .. } => {
                    doc.lock().await.apply_remote(&ops);
                }

                SyncEvent::RemoteAwareness { message } => {
                    presence.lock().await.handle_message(&message);
                }

                SyncEvent::PeerJoined(peer_info) => {
                    let announcements = {
                        let mut p = presence.lock().await;
                        p.register_client(&peer_info);
                        // Re-announce so the newcomer sees our profile and
                        // any drag lock we currently hold.
                        let mut msgs = vec![p.join_message()];
                        if let Some(dragging) = p.local_dragging() {
                            msgs.push(p.set_dragging(Some(dragging)));
                        }
                        msgs
                    };
                    let c = client.lock().await;
                    for msg in &announcements {
                        let _ = c.send_awareness(msg).await;
                    }
                }

                SyncEvent::PeerLeft(client_id) => {
                    presence.lock().await.remove_peer(client_id);
                }

                SyncEvent::DeltaAcked { .. } => {}

                SyncEvent::Disconnected => {
                    *state.write().await = SessionState::Disconnected;
                    let _ = reconnect_tx.send(()).await;
                }
            }
        }
    }

    async fn reconnect_supervisor(
        mut reconnect_rx: mpsc::Receiver<()>,
        doc: Arc<Mutex<FormationDoc>>,
        client: Arc<Mutex<SyncClient>>,
        state: Arc<RwLock<SessionState>>,
        active: Arc<AtomicBool>,
    ) {
        let mut backoff = Backoff::default();
        loop {
            // Attempt until connected, backing off between failures. There
            // is no give-up state: past the ceiling the session shows a
            // persistent reconnecting indicator and keeps trying.
            loop {
                if !active.load(Ordering::SeqCst) {
                    return;
                }
                *state.write().await = SessionState::Connecting;
                let state_vector = doc.lock().await.state_vector();
                let result = client.lock().await.connect(state_vector).await;
                match result {
                    Ok(()) => {
                        backoff.reset();
                        break;
                    }
                    Err(e) => {
                        *state.write().await = SessionState::Disconnected;
                        let delay = backoff.next_delay();
                        log::warn!(
                            "Relay connect failed ({e}); retry {} in {delay:?}",
                            backoff.attempt()
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            // Sleep until the pump reports the next disconnect.
            match reconnect_rx.recv().await {
                Some(()) => continue,
                None => return,
            }
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::NotInitialized)
        }
    }

    /// Sole-writer apply path: optimistic local apply, undo capture, then
    /// broadcast. Returns as soon as the delta is queued — never waits for
    /// network acknowledgment.
    async fn commit(&self, op: Op) -> Result<(), SessionError> {
        self.ensure_active()?;
        let edit = self.doc.lock().await.apply_local(op);
        self.undo.lock().await.record(vec![edit.inverse]);
        self.client
            .lock()
            .await
            .send_delta(&[edit.delta])
            .await
            .map_err(SessionError::Transport)?;
        Ok(())
    }

    // ── Document mutations ──────────────────────────────────────────

    pub async fn add_performer(&self, record: PerformerRecord) -> Result<Uuid, SessionError> {
        let id = Uuid::new_v4();
        self.commit(Op::AddPerformer { id, record }).await?;
        Ok(id)
    }

    pub async fn update_performer(
        &self,
        id: Uuid,
        patch: PerformerPatch,
    ) -> Result<(), SessionError> {
        self.commit(Op::UpdatePerformer { id, patch }).await
    }

    pub async fn remove_performer(&self, id: Uuid) -> Result<(), SessionError> {
        self.commit(Op::RemovePerformer { id }).await
    }

    pub async fn add_keyframe(&self, timestamp_ms: u64) -> Result<Uuid, SessionError> {
        let id = Uuid::new_v4();
        self.commit(Op::AddKeyframe { id, timestamp_ms }).await?;
        Ok(id)
    }

    pub async fn update_keyframe(
        &self,
        id: Uuid,
        patch: KeyframePatch,
    ) -> Result<(), SessionError> {
        self.commit(Op::UpdateKeyframe { id, patch }).await
    }

    pub async fn remove_keyframe(&self, id: Uuid) -> Result<(), SessionError> {
        self.commit(Op::RemoveKeyframe { id }).await
    }

    pub async fn update_position(
        &self,
        keyframe_id: Uuid,
        performer_id: Uuid,
        position: Position,
    ) -> Result<(), SessionError> {
        self.commit(Op::UpdatePosition {
            keyframe_id,
            performer_id,
            position: Some(position),
        })
        .await
    }

    /// Batch position write — one delta, one undo entry.
    pub async fn update_positions(
        &self,
        keyframe_id: Uuid,
        positions: Vec<(Uuid, Position)>,
    ) -> Result<(), SessionError> {
        self.commit(Op::UpdatePositions {
            keyframe_id,
            positions: positions
                .into_iter()
                .map(|(id, pos)| (id, Some(pos)))
                .collect(),
        })
        .await
    }

    pub async fn set_audio_track(&self, track: Option<String>) -> Result<(), SessionError> {
        self.commit(Op::SetAudioTrack { track }).await
    }

    pub async fn update_meta(
        &self,
        fields: Vec<(String, Option<String>)>,
    ) -> Result<(), SessionError> {
        self.commit(Op::UpdateMeta { fields }).await
    }

    // ── Undo / redo ─────────────────────────────────────────────────

    pub async fn can_undo(&self) -> bool {
        self.undo.lock().await.can_undo()
    }

    pub async fn can_redo(&self) -> bool {
        self.undo.lock().await.can_redo()
    }

    /// Revert the latest local edit. Returns `false` when there is
    /// nothing to undo.
    pub async fn undo(&self) -> Result<bool, SessionError> {
        self.ensure_active()?;
        let delta = {
            let mut doc = self.doc.lock().await;
            let mut undo = self.undo.lock().await;
            undo.undo(&mut doc)
        };
        self.broadcast_history_delta(delta).await
    }

    pub async fn redo(&self) -> Result<bool, SessionError> {
        self.ensure_active()?;
        let delta = {
            let mut doc = self.doc.lock().await;
            let mut undo = self.undo.lock().await;
            undo.redo(&mut doc)
        };
        self.broadcast_history_delta(delta).await
    }

    async fn broadcast_history_delta(
        &self,
        delta: Option<Vec<StampedOp>>,
    ) -> Result<bool, SessionError> {
        match delta {
            Some(ops) => {
                self.client
                    .lock()
                    .await
                    .send_delta(&ops)
                    .await
                    .map_err(SessionError::Transport)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Presence ────────────────────────────────────────────────────

    /// Broadcast the local cursor position (throttled, fire-and-forget).
    pub async fn update_cursor(&self, position: Vec2) -> Result<(), SessionError> {
        self.ensure_active()?;
        let msg = self.presence.lock().await.update_local_cursor(position);
        if let Some(msg) = msg {
            let _ = self.client.lock().await.send_awareness(&msg).await;
        }
        Ok(())
    }

    pub async fn clear_cursor(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        let msg = self.presence.lock().await.clear_cursor();
        let _ = self.client.lock().await.send_awareness(&msg).await;
        Ok(())
    }

    pub async fn set_selected_performers(&self, ids: Vec<Uuid>) -> Result<(), SessionError> {
        self.ensure_active()?;
        let msg = self.presence.lock().await.set_selected_performers(ids);
        let _ = self.client.lock().await.send_awareness(&msg).await;
        Ok(())
    }

    /// Remote clients' presence records (cloned snapshot).
    pub async fn peers(&self) -> Vec<PresenceState> {
        self.presence.lock().await.peers().cloned().collect()
    }

    // ── Drag-lock arbitration ───────────────────────────────────────

    pub async fn can_move_performer(&self, performer_id: Uuid) -> DragVerdict {
        self.presence.lock().await.can_move_performer(performer_id)
    }

    /// The presence record currently dragging this performer, if any.
    pub async fn is_performer_being_dragged(&self, performer_id: Uuid) -> Option<PresenceState> {
        self.presence
            .lock()
            .await
            .is_performer_being_dragged(performer_id)
            .cloned()
    }

    /// Claim the advisory drag lock. On a block, surfaces a warning and
    /// returns `false` without touching local presence.
    pub async fn try_start_drag(&self, performer_id: Uuid) -> Result<bool, SessionError> {
        self.ensure_active()?;
        let msg = {
            let mut p = self.presence.lock().await;
            let verdict = p.can_move_performer(performer_id);
            if !verdict.allowed {
                log::warn!(
                    "{} is moving this performer",
                    verdict.blocked_by.as_deref().unwrap_or("Another user")
                );
                return Ok(false);
            }
            p.set_dragging(Some(performer_id))
        };
        let _ = self.client.lock().await.send_awareness(&msg).await;
        Ok(true)
    }

    pub async fn end_drag(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        let msg = {
            let mut p = self.presence.lock().await;
            if p.local_dragging().is_none() {
                return Ok(());
            }
            p.set_dragging(None)
        };
        let _ = self.client.lock().await.send_awareness(&msg).await;
        Ok(())
    }

    // ── Reads and status ────────────────────────────────────────────

    /// Read-only snapshot of the merged formation.
    pub async fn formation(&self) -> FormationSnapshot {
        self.doc.lock().await.snapshot()
    }

    /// Full op history for caching as a future hydration snapshot.
    pub async fn export_state(&self) -> Vec<StampedOp> {
        self.doc.lock().await.full_state()
    }

    pub async fn session_state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == SessionState::Connected
    }

    pub async fn is_syncing(&self) -> bool {
        *self.state.read().await == SessionState::Syncing
    }

    pub async fn has_pending_changes(&self) -> bool {
        self.client.lock().await.has_pending_changes().await
    }

    pub async fn last_synced_at(&self) -> Option<SystemTime> {
        self.client.lock().await.last_synced_at().await
    }

    pub fn client_id(&self) -> Uuid {
        self.info.client_id
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Close the session: leave the room, abort background tasks, drop the
    /// connection, clear presence. Idempotent; afterwards every mutation
    /// fails with [`SessionError::NotInitialized`].
    pub async fn teardown(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        // Best-effort clean departure; the relay synthesizes one anyway.
        let leave = self.presence.lock().await.leave_message();
        let _ = self.client.lock().await.send_awareness(&leave).await;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.client.lock().await.disconnect().await;
        self.presence.lock().await.clear_peers();
        *self.state.write().await = SessionState::Uninitialized;
    }
}
