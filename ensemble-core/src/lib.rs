//! # ensemble-core — Replicated formation document model
//!
//! The conflict-free data layer behind shared formation editing: performers,
//! keyframes, per-keyframe position maps, and an audio-track reference,
//! merged deterministically across replicas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  apply_local   ┌──────────────┐
//! │  Mutation    │ ─────────────► │ FormationDoc │──► StampedOp delta
//! │  (UI intent) │                │ (one replica)│      (to transport)
//! └──────────────┘                └──────┬───────┘
//!                                        │ apply_remote
//!                          remote deltas ┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — Lamport stamps and replica identity (origin markers)
//! - [`merge`] — tagged merge policies: LWW, set-union, delete-wins
//! - [`op`] — the mutation vocabulary and its stamped wire form
//! - [`document`] — the replicated document, state vectors, diffs, snapshots
//! - [`undo`] — origin-scoped undo/redo over inverse deltas
//!
//! No I/O lives here: the crate is pure data plus merge rules, which is what
//! makes convergence testable without a transport in the loop.

pub mod clock;
pub mod document;
pub mod merge;
pub mod op;
pub mod undo;

pub use clock::{LamportClock, ReplicaId, Stamp};
pub use document::{
    FormationDoc, FormationSnapshot, Keyframe, LocalEdit, Performer, StateVector,
};
pub use merge::{arbitrate, LwwRegister, MergeOutcome, MergePolicy, Tombstone};
pub use op::{
    KeyframePatch, Op, PerformerPatch, PerformerRecord, Position, StampedOp,
};
pub use undo::UndoManager;
