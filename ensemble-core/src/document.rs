//! The replicated formation document.
//!
//! ```text
//! local mutation ──► apply_local() ──► StampedOp delta ──► transport
//!                        │                                    │
//!                        ▼                                    ▼
//!                  own replica state ◄── apply_remote() ◄── remote deltas
//! ```
//!
//! State is an op-based CRDT: every mutation is stamped with a Lamport
//! timestamp and a per-origin sequence number, applied optimistically to the
//! local replica, and shipped as a compact delta. Remote ops merge through
//! the policies in [`crate::merge`]; application is commutative,
//! associative, and idempotent, so replicas that see the same set of ops
//! converge to identical state regardless of arrival order or duplication.
//!
//! Per-origin delivery is assumed in order (the relay fans out over one
//! ordered channel per room); `seq` is contiguous per origin, which is what
//! lets a state vector summarize "everything seen" as one integer per
//! origin.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{LamportClock, ReplicaId, Stamp};
use crate::merge::{arbitrate, LwwRegister, MergeOutcome, MergePolicy, Tombstone};
use crate::op::{Op, PerformerPatch, PerformerRecord, Position, StampedOp};

/// Compact summary of which ops a replica has seen: origin → highest seq.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateVector(HashMap<ReplicaId, u64>);

impl StateVector {
    pub fn covers(&self, origin: ReplicaId, seq: u64) -> bool {
        self.0.get(&origin).is_some_and(|&max| seq <= max)
    }

    pub fn observe(&mut self, origin: ReplicaId, seq: u64) {
        let entry = self.0.entry(origin).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    pub fn seen_from(&self, origin: ReplicaId) -> u64 {
        self.0.get(&origin).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PerformerEntry {
    created: Option<Stamp>,
    tombstone: Tombstone,
    name: LwwRegister<String>,
    label: LwwRegister<String>,
    color: LwwRegister<String>,
}

impl PerformerEntry {
    fn placeholder() -> Self {
        Self {
            created: None,
            tombstone: Tombstone::default(),
            name: LwwRegister::placeholder(String::new()),
            label: LwwRegister::placeholder(String::new()),
            color: LwwRegister::placeholder(String::new()),
        }
    }

    fn is_alive(&self) -> bool {
        self.created.is_some() && !self.tombstone.is_buried()
    }
}

#[derive(Debug, Clone)]
struct KeyframeEntry {
    created: Option<Stamp>,
    tombstone: Tombstone,
    timestamp_ms: LwwRegister<u64>,
    positions: HashMap<Uuid, LwwRegister<Option<Position>>>,
}

impl KeyframeEntry {
    fn placeholder() -> Self {
        Self {
            created: None,
            tombstone: Tombstone::default(),
            timestamp_ms: LwwRegister::placeholder(0),
            positions: HashMap::new(),
        }
    }

    fn is_alive(&self) -> bool {
        self.created.is_some() && !self.tombstone.is_buried()
    }
}

/// A performer as seen by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performer {
    pub id: Uuid,
    pub name: String,
    pub label: String,
    pub color: String,
}

/// A keyframe as seen by consumers, with dangling positions filtered out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub id: Uuid,
    pub timestamp_ms: u64,
    pub positions: HashMap<Uuid, Position>,
}

/// Read-only snapshot handed to UI code. Plain data, no CRDT bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormationSnapshot {
    /// Sorted by id for deterministic iteration.
    pub performers: Vec<Performer>,
    /// Sorted by `(timestamp_ms, id)`.
    pub keyframes: Vec<Keyframe>,
    pub audio_track: Option<String>,
    pub meta: BTreeMap<String, String>,
}

/// Result of a local mutation: the delta to broadcast and the inverse op
/// for the undo stack.
#[derive(Debug, Clone)]
pub struct LocalEdit {
    pub delta: StampedOp,
    pub inverse: Op,
}

/// One replica of the shared formation document.
pub struct FormationDoc {
    clock: LamportClock,
    next_seq: u64,
    seen: StateVector,
    /// Retained op history, in integration order. Serves diff requests.
    log: Vec<StampedOp>,
    performers: HashMap<Uuid, PerformerEntry>,
    keyframes: HashMap<Uuid, KeyframeEntry>,
    audio_track: LwwRegister<Option<String>>,
    meta: HashMap<String, LwwRegister<Option<String>>>,
}

impl FormationDoc {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            clock: LamportClock::new(replica),
            next_seq: 0,
            seen: StateVector::default(),
            log: Vec::new(),
            performers: HashMap::new(),
            keyframes: HashMap::new(),
            audio_track: LwwRegister::placeholder(None),
            meta: HashMap::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    /// Apply a local mutation: optimistic immediate apply plus a stamped
    /// delta for transport and the inverse op for undo.
    pub fn apply_local(&mut self, op: Op) -> LocalEdit {
        let inverse = self.invert(&op);
        self.next_seq += 1;
        let stamped = StampedOp {
            seq: self.next_seq,
            stamp: self.clock.tick(),
            op,
        };
        self.integrate(&stamped);
        LocalEdit {
            delta: stamped,
            inverse,
        }
    }

    /// Merge remote ops. Returns how many were new (duplicates are skipped,
    /// which is what makes reconnect replay exactly-once).
    pub fn apply_remote(&mut self, ops: &[StampedOp]) -> usize {
        let mut applied = 0;
        for sop in ops {
            if self.integrate(sop) {
                applied += 1;
            }
        }
        applied
    }

    fn integrate(&mut self, sop: &StampedOp) -> bool {
        if self.seen.covers(sop.origin(), sop.seq) {
            log::trace!("Skipping duplicate op {} from {}", sop.seq, sop.origin());
            return false;
        }
        self.clock.observe(sop.stamp);
        self.seen.observe(sop.origin(), sop.seq);
        self.log.push(sop.clone());
        self.apply_op(&sop.op, sop.stamp);
        true
    }

    fn apply_op(&mut self, op: &Op, stamp: Stamp) {
        match op {
            Op::AddPerformer { id, record } => {
                let entry = self
                    .performers
                    .entry(*id)
                    .or_insert_with(PerformerEntry::placeholder);
                if arbitrate(MergePolicy::SetUnion, entry.created, stamp, false)
                    == MergeOutcome::Applied
                {
                    entry.created = Some(stamp);
                }
                entry.name.merge(record.name.clone(), stamp);
                entry.label.merge(record.label.clone(), stamp);
                entry.color.merge(record.color.clone(), stamp);
            }
            Op::UpdatePerformer { id, patch } => {
                let entry = self
                    .performers
                    .entry(*id)
                    .or_insert_with(PerformerEntry::placeholder);
                if let Some(name) = &patch.name {
                    entry.name.merge(name.clone(), stamp);
                }
                if let Some(label) = &patch.label {
                    entry.label.merge(label.clone(), stamp);
                }
                if let Some(color) = &patch.color {
                    entry.color.merge(color.clone(), stamp);
                }
            }
            Op::RemovePerformer { id } => {
                // Entry is created even if the add has not arrived yet, so
                // the tombstone dominates whenever it does.
                let entry = self
                    .performers
                    .entry(*id)
                    .or_insert_with(PerformerEntry::placeholder);
                entry.tombstone.bury(stamp);
            }
            Op::AddKeyframe { id, timestamp_ms } => {
                let entry = self
                    .keyframes
                    .entry(*id)
                    .or_insert_with(KeyframeEntry::placeholder);
                if arbitrate(MergePolicy::SetUnion, entry.created, stamp, false)
                    == MergeOutcome::Applied
                {
                    entry.created = Some(stamp);
                }
                entry.timestamp_ms.merge(*timestamp_ms, stamp);
            }
            Op::UpdateKeyframe { id, patch } => {
                let entry = self
                    .keyframes
                    .entry(*id)
                    .or_insert_with(KeyframeEntry::placeholder);
                if let Some(ts) = patch.timestamp_ms {
                    entry.timestamp_ms.merge(ts, stamp);
                }
            }
            Op::RemoveKeyframe { id } => {
                let entry = self
                    .keyframes
                    .entry(*id)
                    .or_insert_with(KeyframeEntry::placeholder);
                entry.tombstone.bury(stamp);
            }
            Op::UpdatePosition {
                keyframe_id,
                performer_id,
                position,
            } => {
                self.merge_position(*keyframe_id, *performer_id, *position, stamp);
            }
            Op::UpdatePositions {
                keyframe_id,
                positions,
            } => {
                for (performer_id, position) in positions {
                    self.merge_position(*keyframe_id, *performer_id, *position, stamp);
                }
            }
            Op::SetAudioTrack { track } => {
                self.audio_track.merge(track.clone(), stamp);
            }
            Op::UpdateMeta { fields } => {
                for (key, value) in fields {
                    let slot = self
                        .meta
                        .entry(key.clone())
                        .or_insert_with(|| LwwRegister::placeholder(None));
                    slot.merge(value.clone(), stamp);
                }
            }
        }
    }

    fn merge_position(
        &mut self,
        keyframe_id: Uuid,
        performer_id: Uuid,
        position: Option<Position>,
        stamp: Stamp,
    ) {
        let entry = self
            .keyframes
            .entry(keyframe_id)
            .or_insert_with(KeyframeEntry::placeholder);
        let slot = entry
            .positions
            .entry(performer_id)
            .or_insert_with(|| LwwRegister::placeholder(None));
        slot.merge(position, stamp);
    }

    /// Compute the inverse of `op` against current (pre-apply) state.
    ///
    /// Inverting a structural remove yields the matching add, which the
    /// sticky tombstone turns into a no-op on apply; the uniform shape keeps
    /// the undo path free of special cases.
    fn invert(&self, op: &Op) -> Op {
        match op {
            Op::AddPerformer { id, .. } => Op::RemovePerformer { id: *id },
            Op::UpdatePerformer { id, patch } => {
                let entry = self.performers.get(id);
                let prev = |field: fn(&PerformerEntry) -> &LwwRegister<String>| {
                    entry.map(|e| field(e).get().clone()).unwrap_or_default()
                };
                Op::UpdatePerformer {
                    id: *id,
                    patch: PerformerPatch {
                        name: patch.name.as_ref().map(|_| prev(|e| &e.name)),
                        label: patch.label.as_ref().map(|_| prev(|e| &e.label)),
                        color: patch.color.as_ref().map(|_| prev(|e| &e.color)),
                    },
                }
            }
            Op::RemovePerformer { id } => Op::AddPerformer {
                id: *id,
                record: self
                    .performers
                    .get(id)
                    .map(|e| PerformerRecord {
                        name: e.name.get().clone(),
                        label: e.label.get().clone(),
                        color: e.color.get().clone(),
                    })
                    .unwrap_or(PerformerRecord {
                        name: String::new(),
                        label: String::new(),
                        color: String::new(),
                    }),
            },
            Op::AddKeyframe { id, .. } => Op::RemoveKeyframe { id: *id },
            Op::UpdateKeyframe { id, patch } => Op::UpdateKeyframe {
                id: *id,
                patch: crate::op::KeyframePatch {
                    timestamp_ms: patch
                        .timestamp_ms
                        .map(|_| self.keyframes.get(id).map_or(0, |e| *e.timestamp_ms.get())),
                },
            },
            Op::RemoveKeyframe { id } => Op::AddKeyframe {
                id: *id,
                timestamp_ms: self.keyframes.get(id).map_or(0, |e| *e.timestamp_ms.get()),
            },
            Op::UpdatePosition {
                keyframe_id,
                performer_id,
                ..
            } => Op::UpdatePosition {
                keyframe_id: *keyframe_id,
                performer_id: *performer_id,
                position: self.current_position(*keyframe_id, *performer_id),
            },
            Op::UpdatePositions {
                keyframe_id,
                positions,
            } => Op::UpdatePositions {
                keyframe_id: *keyframe_id,
                positions: positions
                    .iter()
                    .map(|(pid, _)| (*pid, self.current_position(*keyframe_id, *pid)))
                    .collect(),
            },
            Op::SetAudioTrack { .. } => Op::SetAudioTrack {
                track: self.audio_track.get().clone(),
            },
            Op::UpdateMeta { fields } => Op::UpdateMeta {
                fields: fields
                    .iter()
                    .map(|(key, _)| {
                        (
                            key.clone(),
                            self.meta.get(key).and_then(|slot| slot.get().clone()),
                        )
                    })
                    .collect(),
            },
        }
    }

    fn current_position(&self, keyframe_id: Uuid, performer_id: Uuid) -> Option<Position> {
        self.keyframes
            .get(&keyframe_id)
            .and_then(|kf| kf.positions.get(&performer_id))
            .and_then(|slot| *slot.get())
    }

    /// Read-only snapshot for consumers.
    ///
    /// Dangling references — positions for performers a concurrent edit has
    /// since deleted — are filtered here, never treated as corruption.
    pub fn snapshot(&self) -> FormationSnapshot {
        let mut performers: Vec<Performer> = self
            .performers
            .iter()
            .filter(|(_, e)| e.is_alive())
            .map(|(id, e)| Performer {
                id: *id,
                name: e.name.get().clone(),
                label: e.label.get().clone(),
                color: e.color.get().clone(),
            })
            .collect();
        performers.sort_by_key(|p| p.id);

        let mut keyframes: Vec<Keyframe> = self
            .keyframes
            .iter()
            .filter(|(_, e)| e.is_alive())
            .map(|(id, e)| Keyframe {
                id: *id,
                timestamp_ms: *e.timestamp_ms.get(),
                positions: e
                    .positions
                    .iter()
                    .filter(|(pid, _)| {
                        self.performers.get(*pid).is_some_and(|p| p.is_alive())
                    })
                    .filter_map(|(pid, slot)| slot.get().map(|pos| (*pid, pos)))
                    .collect(),
            })
            .collect();
        keyframes.sort_by_key(|k| (k.timestamp_ms, k.id));

        FormationSnapshot {
            performers,
            keyframes,
            audio_track: self.audio_track.get().clone(),
            meta: self
                .meta
                .iter()
                .filter_map(|(k, slot)| slot.get().clone().map(|v| (k.clone(), v)))
                .collect(),
        }
    }

    pub fn state_vector(&self) -> StateVector {
        self.seen.clone()
    }

    /// Ops the remote has not seen, in integration order.
    pub fn diff(&self, remote: &StateVector) -> Vec<StampedOp> {
        self.log
            .iter()
            .filter(|sop| !remote.covers(sop.origin(), sop.seq))
            .cloned()
            .collect()
    }

    /// Full retained history; used to hydrate a fresh replica.
    pub fn full_state(&self) -> Vec<StampedOp> {
        self.diff(&StateVector::default())
    }

    /// Number of ops integrated so far.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }
}
