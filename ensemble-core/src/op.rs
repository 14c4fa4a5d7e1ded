//! Operations on the formation document and their stamped wire form.
//!
//! A delta is a batch of [`StampedOp`]s: each op carries the authoring
//! replica's Lamport stamp (for last-writer-wins arbitration) and a
//! per-replica sequence number (for sync bookkeeping and duplicate
//! suppression). Deltas are sized by the change, never by the document.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{ReplicaId, Stamp};

/// A performer's replicated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformerRecord {
    pub name: String,
    pub label: String,
    pub color: String,
}

/// Partial update to a performer record; `None` fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformerPatch {
    pub name: Option<String>,
    pub label: Option<String>,
    pub color: Option<String>,
}

/// A performer's position at one keyframe, in stage coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub rotation: Option<f32>,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            rotation: None,
        }
    }

    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.rotation = Some(rotation);
        self
    }
}

/// Partial update to a keyframe; `None` fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyframePatch {
    pub timestamp_ms: Option<u64>,
}

/// One mutation of the formation document.
///
/// Position writes carry `Option<Position>`: `None` clears the entry, which
/// is how undoing a first placement is expressed. Meta writes are field-wise
/// for the same reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    AddPerformer {
        id: Uuid,
        record: PerformerRecord,
    },
    UpdatePerformer {
        id: Uuid,
        patch: PerformerPatch,
    },
    RemovePerformer {
        id: Uuid,
    },
    AddKeyframe {
        id: Uuid,
        timestamp_ms: u64,
    },
    UpdateKeyframe {
        id: Uuid,
        patch: KeyframePatch,
    },
    RemoveKeyframe {
        id: Uuid,
    },
    UpdatePosition {
        keyframe_id: Uuid,
        performer_id: Uuid,
        position: Option<Position>,
    },
    UpdatePositions {
        keyframe_id: Uuid,
        positions: Vec<(Uuid, Option<Position>)>,
    },
    SetAudioTrack {
        track: Option<String>,
    },
    UpdateMeta {
        fields: Vec<(String, Option<String>)>,
    },
}

/// An op with its origin bookkeeping, ready for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedOp {
    /// Per-origin sequence number, contiguous from 1.
    pub seq: u64,
    /// Lamport stamp; `stamp.replica` is the authoring origin.
    pub stamp: Stamp,
    pub op: Op,
}

impl StampedOp {
    pub fn origin(&self) -> ReplicaId {
        self.stamp.replica
    }
}
