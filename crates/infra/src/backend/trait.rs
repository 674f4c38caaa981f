use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dbworker_core::{
    Failure, NaturalKey, RecordId, RecordState, StoreResult, StoredRow, TableSpec, Value,
};

/// Column assignment applied by [`DatabaseTransaction::update`].
pub type Assignment = (String, Value);

/// Parameters of one stalled-record sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    /// Records that entered `processing` strictly before this instant are stalled.
    pub cutoff: DateTime<Utc>,
    /// Timestamp written to `finished_at` for records that exhaust their resets.
    pub now: DateTime<Utc>,
    /// Records already reset this many times are errored instead of requeued.
    pub max_num_resets: u32,
    /// Failure summary written to records that exhaust their resets.
    pub failure_summary: String,
}

/// Records touched by one stalled-record sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    pub requeued: Vec<RecordId>,
    pub errored: Vec<RecordId>,
}

impl ResetOutcome {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.errored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Relational store holding queue tables.
///
/// Every method on this trait runs in its own short transaction. Operations
/// that must not wait on a row held by an open [`DatabaseTransaction`] skip
/// that row (`claim_next`, `reset_stalled`) or fail with
/// `StoreError::LockNotAvailable` (`requeue`, `mark_queued`).
#[async_trait]
pub trait Database: Send + Sync + 'static {
    type Tx: DatabaseTransaction;

    /// Insert a row in `state` and return its id.
    async fn insert(
        &self,
        table: &TableSpec,
        state: RecordState,
        values: &[Value],
        now: DateTime<Utc>,
    ) -> StoreResult<RecordId>;

    /// Atomically move the first dequeueable, unlocked row to `processing`.
    async fn claim_next(&self, table: &TableSpec, now: DateTime<Utc>)
    -> StoreResult<Option<RecordId>>;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    /// Row by id, with its queue rank.
    async fn fetch(&self, table: &TableSpec, id: RecordId) -> StoreResult<Option<StoredRow>>;

    async fn count(&self, table: &TableSpec, states: &[RecordState]) -> StoreResult<u64>;

    /// Whether a row in one of `states` matches the natural key.
    ///
    /// Callers check `key` with [`TableSpec::check_key`] first.
    async fn exists(
        &self,
        table: &TableSpec,
        states: &[RecordState],
        key: &NaturalKey,
    ) -> StoreResult<bool>;

    async fn states(
        &self,
        table: &TableSpec,
        ids: &[RecordId],
    ) -> StoreResult<Vec<(RecordId, RecordState)>>;

    /// Put a row back in the queue, not to be dequeued before `after`.
    async fn requeue(
        &self,
        table: &TableSpec,
        id: RecordId,
        after: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Promote an `uploading` row to `queued`.
    async fn mark_queued(
        &self,
        table: &TableSpec,
        id: RecordId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn reset_stalled(
        &self,
        table: &TableSpec,
        request: &ResetRequest,
    ) -> StoreResult<ResetOutcome>;
}

/// An open transaction on a [`Database`].
///
/// Dropping a transaction without calling [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) rolls it back and releases its row locks.
#[async_trait]
pub trait DatabaseTransaction: Send + 'static {
    /// `SELECT ... FOR UPDATE SKIP LOCKED` on one row.
    ///
    /// Returns `None` when the row is missing or locked elsewhere.
    async fn lock(&mut self, table: &TableSpec, id: RecordId) -> StoreResult<Option<StoredRow>>;

    async fn insert(
        &mut self,
        table: &TableSpec,
        state: RecordState,
        values: &[Value],
        now: DateTime<Utc>,
    ) -> StoreResult<RecordId>;

    /// Write domain columns of one row. Returns `false` when the row is gone.
    async fn update(
        &mut self,
        table: &TableSpec,
        id: RecordId,
        assignments: &[Assignment],
    ) -> StoreResult<bool>;

    /// Write a terminal state. Applies only to rows that are processing or
    /// were already finalized inside this lease; returns `false` otherwise.
    async fn finalize(
        &mut self,
        table: &TableSpec,
        id: RecordId,
        state: RecordState,
        failure: Option<&Failure>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn savepoint(&mut self, name: &str) -> StoreResult<()>;

    /// Undo everything since `name` and release it.
    async fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}
