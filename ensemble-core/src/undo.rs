//! Undo/redo scoped to locally-originated mutations.
//!
//! Remote edits never enter the stacks: the manager only records the inverse
//! ops that [`crate::document::FormationDoc::apply_local`] hands back for
//! the local origin. Undo replays an inverse group through the normal local
//! mutation path, so the result is stamped, broadcast, and merged like any
//! other edit — it never bypasses the document's invariants. Undoing an
//! edit to an entity a remote peer has since deleted lands on a tombstone
//! and is a silent no-op (delete-wins).

use crate::document::{FormationDoc, LocalEdit};
use crate::op::{Op, StampedOp};

const DEFAULT_DEPTH: usize = 256;

/// Undo/redo stacks for one local origin.
pub struct UndoManager {
    undo: Vec<Vec<Op>>,
    redo: Vec<Vec<Op>>,
    depth: usize,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

impl UndoManager {
    pub fn new(depth: usize) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            depth: depth.max(1),
        }
    }

    /// Record the inverse of a fresh local edit. Clears the redo stack,
    /// as any new edit forks history.
    pub fn record(&mut self, inverse: Vec<Op>) {
        if inverse.is_empty() {
            return;
        }
        self.undo.push(inverse);
        if self.undo.len() > self.depth {
            self.undo.remove(0);
        }
        self.redo.clear();
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Revert the most recent local edit. Returns the stamped delta to
    /// broadcast, or `None` if the stack is empty.
    pub fn undo(&mut self, doc: &mut FormationDoc) -> Option<Vec<StampedOp>> {
        let group = self.undo.pop()?;
        let (delta, reverse) = Self::apply_group(doc, group);
        self.redo.push(reverse);
        Some(delta)
    }

    /// Re-apply the most recently undone edit.
    pub fn redo(&mut self, doc: &mut FormationDoc) -> Option<Vec<StampedOp>> {
        let group = self.redo.pop()?;
        let (delta, reverse) = Self::apply_group(doc, group);
        self.undo.push(reverse);
        Some(delta)
    }

    fn apply_group(doc: &mut FormationDoc, group: Vec<Op>) -> (Vec<StampedOp>, Vec<Op>) {
        let mut delta = Vec::with_capacity(group.len());
        let mut reverse = Vec::with_capacity(group.len());
        for op in group {
            let LocalEdit {
                delta: stamped,
                inverse,
            } = doc.apply_local(op);
            delta.push(stamped);
            reverse.push(inverse);
        }
        // The reverting group must replay in reverse order.
        reverse.reverse();
        (delta, reverse)
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
