//! # ensemble-collab — Real-time collaboration layer for shared formations
//!
//! WebSocket-based multiplayer editing over the CRDT document model in
//! `ensemble-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ CollabSession │ ◄─────────────────► │ RelayServer │
//! │ (per client)  │     Binary Proto    │ (central)   │
//! └──────┬────────┘                     └──────┬──────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌───────────────┐                     ┌─────────────┐
//! │ FormationDoc  │                     │ FormationDoc│
//! │ (local)       │                     │ (authority) │
//! └───────────────┘                     └──────┬──────┘
//!                                              │
//!                                      ┌───────┴───────┐
//!                                      │ BroadcastGroup│
//!                                      │ (fan-out)     │
//!                                      └───────────────┘
//! ```
//!
//! Document deltas and presence travel the same socket but never mix:
//! deltas are applied, logged, and acked; presence is fanned out and
//! forgotten.
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage,
//!   LZ4-compressed op payloads)
//! - [`presence`] — Ephemeral awareness: cursors, selections, drag locks
//! - [`broadcast`] — Room fan-out with backpressure
//! - [`delta_log`] — The relay's durable document-delta log
//! - [`server`] — WebSocket relay with room routing
//! - [`client`] — Sync client: handshake, pending deltas, backoff
//! - [`session`] — The collaboration facade consumed by UI code

pub mod broadcast;
pub mod client;
pub mod delta_log;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{Backoff, ConnectionState, PendingDeltas, SyncClient, SyncEvent};
pub use delta_log::{DeltaLog, DeltaLogStats, LogEntry};
pub use presence::{
    AwarenessMessage, DragVerdict, PresenceColor, PresenceRoom, PresenceState, Vec2,
};
pub use protocol::{ClientInfo, MessageType, ProtocolError, SyncMessage};
pub use server::{FormationRoom, RelayServer, RelayStats, RoomDirectory, ServerConfig};
pub use session::{
    CollabSession, SessionConfig, SessionError, SessionState, UserProfile,
};
