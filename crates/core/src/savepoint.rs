//! Savepoint bookkeeping for an open transaction.
//!
//! The stack mirrors the savepoints issued against the database and records
//! the depth at which the leased record was finalized. Rolling back to a
//! savepoint that predates a finalization undoes it, so the handle must be
//! finalized again before it can commit.

use crate::error::QueueError;
use crate::id::SavepointId;
use crate::record::RecordState;

#[derive(Debug, Clone, Default)]
pub struct SavepointStack {
    active: Vec<SavepointId>,
    next_id: u64,
    /// Stack depth and written state of each finalization, oldest first.
    finalizations: Vec<(usize, RecordState)>,
}

/// Outcome of a rollback applied to the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollback {
    /// Savepoints released by the rollback, target included, innermost last.
    pub released: Vec<SavepointId>,
    /// Whether the rollback undid the finalization.
    pub cleared_finalized: bool,
}

impl SavepointStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id without making it active.
    ///
    /// Callers issue the SQL savepoint with this id and then [`push`](Self::push)
    /// it once the database accepted it.
    pub fn allocate(&mut self) -> SavepointId {
        self.next_id += 1;
        SavepointId::new(self.next_id)
    }

    pub fn push(&mut self, id: SavepointId) {
        self.active.push(id);
    }

    pub fn depth(&self) -> usize {
        self.active.len()
    }

    pub fn innermost(&self) -> Option<SavepointId> {
        self.active.last().copied()
    }

    /// Record that the handle's record was moved to `state` at the current depth.
    pub fn mark_finalized(&mut self, state: RecordState) {
        self.finalizations.push((self.active.len(), state));
    }

    pub fn is_finalized(&self) -> bool {
        !self.finalizations.is_empty()
    }

    /// Terminal state of the latest finalization still in effect.
    pub fn finalized_state(&self) -> Option<RecordState> {
        self.finalizations.last().map(|(_, state)| *state)
    }

    /// Position of `id` on the stack, without changing anything.
    pub fn position(&self, id: SavepointId) -> Result<usize, QueueError> {
        if self.active.is_empty() {
            return Err(QueueError::NoSavepoint);
        }
        self.active
            .iter()
            .rposition(|active| *active == id)
            .ok_or(QueueError::UnknownSavepoint(id))
    }

    /// Pop `id` and every savepoint above it.
    ///
    /// Finalizations made after the target savepoint was established are
    /// discarded; an earlier one still counts. The stack is left unchanged
    /// on error.
    pub fn rollback_to(&mut self, id: SavepointId) -> Result<Rollback, QueueError> {
        let position = self.position(id)?;
        let released = self.active.split_off(position);

        let was_finalized = self.is_finalized();
        self.finalizations.retain(|(depth, _)| *depth <= position);
        let cleared_finalized = was_finalized && !self.is_finalized();

        Ok(Rollback {
            released,
            cleared_finalized,
        })
    }
}
