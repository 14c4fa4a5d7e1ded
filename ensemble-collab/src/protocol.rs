//! Binary wire protocol between editing clients and the formation relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ client_id │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Document payloads (deltas and handshake diffs) are LZ4 block-compressed
//! batches of stamped ops — sized by the change, never by the document.
//! Awareness payloads are opaque ephemeral bytes the relay fans out and
//! discards; only document messages reach the durable delta log.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ensemble_core::{StampedOp, StateVector};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector for the sync handshake
    SyncStep1 = 1,
    /// Stamped-op diff response
    SyncStep2 = 2,
    /// Incremental document delta
    Delta = 3,
    /// Relay acknowledgement of a client delta, by clock
    DeltaAck = 4,
    /// Ephemeral presence update
    Awareness = 5,
    /// Client joined notification
    PeerJoined = 6,
    /// Client left notification
    PeerLeft = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Client identity with display metadata.
///
/// `client_id` identifies one open editing session (and doubles as the
/// document replica id); `user_id` identifies the human, as supplied by the
/// identity provider. Presence color is derived from `user_id` so every
/// session of the same user renders the same color everywhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
}

impl ClientInfo {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            avatar: None,
        }
    }

    /// Create with explicit client_id (for testing)
    pub fn with_client_id(client_id: Uuid, user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            client_id,
            user_id,
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub client_id: Uuid,
    pub doc_id: Uuid,
    /// Send-counter clock; acks reference it
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_ops(ops: &[StampedOp]) -> Result<Vec<u8>, ProtocolError> {
    let raw = bincode::serde::encode_to_vec(ops, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_ops(payload: &[u8]) -> Result<Vec<StampedOp>, ProtocolError> {
    let raw = lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| ProtocolError::DecompressionError(e.to_string()))?;
    let (ops, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(ops)
}

impl SyncMessage {
    /// Create a document delta message.
    pub fn delta(
        client_id: Uuid,
        doc_id: Uuid,
        clock: u64,
        ops: &[StampedOp],
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Delta,
            client_id,
            doc_id,
            clock,
            payload: encode_ops(ops)?,
        })
    }

    /// Create a delta acknowledgement. Authored by the relay, so the
    /// client id is nil.
    pub fn delta_ack(doc_id: Uuid, clock: u64) -> Self {
        Self {
            msg_type: MessageType::DeltaAck,
            client_id: Uuid::nil(),
            doc_id,
            clock,
            payload: Vec::new(),
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(
        client_id: Uuid,
        doc_id: Uuid,
        state_vector: &StateVector,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(state_vector, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::SyncStep1,
            client_id,
            doc_id,
            clock: 0,
            payload,
        })
    }

    /// Create a sync step 2 (op diff response).
    pub fn sync_step2(
        client_id: Uuid,
        doc_id: Uuid,
        ops: &[StampedOp],
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep2,
            client_id,
            doc_id,
            clock: 0,
            payload: encode_ops(ops)?,
        })
    }

    /// Create an awareness message carrying an encoded presence payload.
    pub fn awareness(client_id: Uuid, doc_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            client_id,
            doc_id,
            clock: 0,
            payload,
        }
    }

    /// Create a client joined notification.
    pub fn peer_joined(doc_id: Uuid, info: &ClientInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::PeerJoined,
            client_id: info.client_id,
            doc_id,
            clock: 0,
            payload,
        })
    }

    /// Create a client left notification.
    pub fn peer_left(client_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            client_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            client_id,
            doc_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(client_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            client_id,
            doc_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the stamped ops of a Delta or SyncStep2 payload.
    pub fn ops(&self) -> Result<Vec<StampedOp>, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Delta | MessageType::SyncStep2) {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_ops(&self.payload)
    }

    /// Parse a SyncStep1 state vector payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        if self.msg_type != MessageType::SyncStep1 {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (sv, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(sv)
    }

    /// Parse a PeerJoined client info payload.
    pub fn client_info(&self) -> Result<ClientInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    DecompressionError(String),
    InvalidMessageType,
    ConnectionClosed,
    QueueFull,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::DecompressionError(e) => write!(f, "Decompression error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::QueueFull => write!(f, "Outbound queue full"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::{FormationDoc, Op, PerformerRecord};

    fn sample_ops() -> Vec<StampedOp> {
        let mut doc = FormationDoc::new(Uuid::new_v4());
        let edit = doc.apply_local(Op::AddPerformer {
            id: Uuid::new_v4(),
            record: PerformerRecord {
                name: "Ada".into(),
                label: "P1".into(),
                color: "#a3c94e".into(),
            },
        });
        vec![edit.delta]
    }

    #[test]
    fn test_delta_roundtrip() {
        let client = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let ops = sample_ops();

        let msg = SyncMessage::delta(client, doc, 42, &ops).unwrap();
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Delta);
        assert_eq!(decoded.client_id, client);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.ops().unwrap(), ops);
    }

    #[test]
    fn test_sync_step1_roundtrip() {
        let mut doc = FormationDoc::new(Uuid::new_v4());
        doc.apply_local(Op::SetAudioTrack {
            track: Some("t".into()),
        });
        let sv = doc.state_vector();

        let msg = SyncMessage::sync_step1(Uuid::new_v4(), Uuid::new_v4(), &sv).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::SyncStep1);
        assert_eq!(decoded.state_vector().unwrap(), sv);
    }

    #[test]
    fn test_sync_step2_roundtrip() {
        let ops = sample_ops();
        let msg = SyncMessage::sync_step2(Uuid::nil(), Uuid::new_v4(), &ops).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::SyncStep2);
        assert_eq!(decoded.ops().unwrap(), ops);
    }

    #[test]
    fn test_delta_ack() {
        let doc = Uuid::new_v4();
        let msg = SyncMessage::delta_ack(doc, 7);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::DeltaAck);
        assert_eq!(decoded.client_id, Uuid::nil());
        assert_eq!(decoded.clock, 7);
    }

    #[test]
    fn test_peer_joined_roundtrip() {
        let info = ClientInfo::new(Uuid::new_v4(), "Alice").with_avatar("a.png");
        let doc = Uuid::new_v4();

        let msg = SyncMessage::peer_joined(doc, &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PeerJoined);
        let parsed = decoded.client_info().unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_peer_left_roundtrip() {
        let client = Uuid::new_v4();
        let msg = SyncMessage::peer_left(client, Uuid::new_v4());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PeerLeft);
        assert_eq!(decoded.client_id, client);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_ping_pong() {
        let client = Uuid::new_v4();
        let ping = SyncMessage::decode(&SyncMessage::ping(client).encode().unwrap()).unwrap();
        let pong = SyncMessage::decode(&SyncMessage::pong(client).encode().unwrap()).unwrap();
        assert_eq!(ping.msg_type, MessageType::Ping);
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[test]
    fn test_ops_accessor_rejects_wrong_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(msg.ops().is_err());
        assert!(msg.state_vector().is_err());
        assert!(msg.client_info().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_empty_delta() {
        let msg = SyncMessage::delta(Uuid::new_v4(), Uuid::new_v4(), 0, &[]).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert!(decoded.ops().unwrap().is_empty());
    }

    #[test]
    fn test_delta_size_independent_of_document() {
        // A single-op delta stays small no matter how much history the
        // authoring document carries.
        let mut doc = FormationDoc::new(Uuid::new_v4());
        for i in 0..500 {
            doc.apply_local(Op::UpdateMeta {
                fields: vec![(format!("k{i}"), Some("v".into()))],
            });
        }
        let edit = doc.apply_local(Op::SetAudioTrack {
            track: Some("t".into()),
        });

        let msg = SyncMessage::delta(Uuid::new_v4(), Uuid::new_v4(), 1, &[edit.delta]).unwrap();
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 256,
            "Encoded size {} too large for a one-op delta",
            encoded.len()
        );
    }

    #[test]
    fn test_client_info_session_vs_user_identity() {
        let user = Uuid::new_v4();
        let a = ClientInfo::new(user, "Alice");
        let b = ClientInfo::new(user, "Alice");
        // Two sessions of the same user share the user id, never the
        // client id.
        assert_eq!(a.user_id, b.user_id);
        assert_ne!(a.client_id, b.client_id);
    }
}
