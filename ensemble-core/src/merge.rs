//! Field-kind merge policies for the formation CRDT.
//!
//! Every replicated field resolves concurrent writes through one of three
//! policies, dispatched by a single arbitration function so the conflict
//! rules stay data-driven and testable without any transport in the loop:
//!
//! - [`MergePolicy::Lww`] — scalar fields (names, colors, positions, meta):
//!   the write with the greater `(lamport, replica)` stamp wins.
//! - [`MergePolicy::SetUnion`] — structural additions (new performer or
//!   keyframe ids): first add establishes the entity, later adds of the same
//!   id are absorbed.
//! - [`MergePolicy::DeleteWins`] — structural deletions: a tombstone is
//!   sticky and dominates any concurrent update or re-add of the entity.
//!
//! All three are commutative, associative, and idempotent, which is what
//! makes the document converge regardless of delivery order.

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;

/// Tagged merge strategy for a replicated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Last-writer-wins by logical stamp.
    Lww,
    /// Additions union; the first add wins, duplicates are absorbed.
    SetUnion,
    /// A tombstone dominates everything, including later writes.
    DeleteWins,
}

/// What the arbitration decided for an incoming write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The incoming write becomes (part of) the new state.
    Applied,
    /// The incoming write lost and leaves no trace.
    Ignored,
}

/// The single merge decision point.
///
/// `current` is the stamp of the present value (`None` if the slot is
/// empty), `incoming` the stamp of the new write, `buried` whether the
/// owning entity carries a tombstone.
pub fn arbitrate(
    policy: MergePolicy,
    current: Option<Stamp>,
    incoming: Stamp,
    buried: bool,
) -> MergeOutcome {
    match policy {
        MergePolicy::Lww => match current {
            Some(cur) if incoming <= cur => MergeOutcome::Ignored,
            _ => MergeOutcome::Applied,
        },
        MergePolicy::SetUnion => match current {
            Some(_) => MergeOutcome::Ignored,
            None => MergeOutcome::Applied,
        },
        MergePolicy::DeleteWins => {
            if buried {
                MergeOutcome::Ignored
            } else {
                MergeOutcome::Applied
            }
        }
    }
}

/// Last-writer-wins register over a single scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    stamp: Stamp,
}

impl<T> LwwRegister<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    /// A register that any real write will overwrite.
    pub fn placeholder(value: T) -> Self {
        Self::new(value, Stamp::ZERO)
    }

    /// Merge an incoming write; keeps the greater stamp.
    pub fn merge(&mut self, value: T, stamp: Stamp) -> MergeOutcome {
        match arbitrate(MergePolicy::Lww, Some(self.stamp), stamp, false) {
            MergeOutcome::Applied => {
                self.value = value;
                self.stamp = stamp;
                MergeOutcome::Applied
            }
            MergeOutcome::Ignored => MergeOutcome::Ignored,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// True once a real write has landed (placeholders have not).
    pub fn is_written(&self) -> bool {
        self.stamp != Stamp::ZERO
    }
}

/// Sticky delete marker for a structural entity.
///
/// Once buried, an entity stays buried: concurrent or later updates still
/// merge into its registers (convergence requires it) but the entity is
/// filtered from every read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Tombstone(Option<Stamp>);

impl Tombstone {
    pub fn bury(&mut self, stamp: Stamp) -> MergeOutcome {
        match arbitrate(MergePolicy::DeleteWins, self.0, stamp, self.0.is_some()) {
            MergeOutcome::Applied => {
                self.0 = Some(stamp);
                MergeOutcome::Applied
            }
            MergeOutcome::Ignored => MergeOutcome::Ignored,
        }
    }

    pub fn is_buried(&self) -> bool {
        self.0.is_some()
    }
}
