use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dbworker_core::{
    Failure, InitialState, NaturalKey, QueueResult, Record, RecordId, RecordKind, RecordState,
    SavepointId,
};

use crate::backend::{Assignment, ResetOutcome};

/// Payload type of a store's record kind.
pub type PayloadOf<S> = <<S as QueueStore>::Kind as RecordKind>::Payload;

/// Exclusive claim on one dequeued record.
///
/// Every write goes through the lease's transaction. The record must be
/// marked complete or errored before `done(Ok(()))` commits; after `done`
/// every call fails with `QueueError::NoTransaction`. Dropping a lease
/// without calling `done` rolls its transaction back.
#[async_trait]
pub trait JobLease: Send + 'static {
    fn record_id(&self) -> RecordId;

    /// Terminal state written by the latest mark still in effect.
    ///
    /// `None` until the record is marked, and again after a rollback to a
    /// savepoint taken before every mark.
    fn finalized_state(&self) -> Option<RecordState>;

    fn is_finalized(&self) -> bool {
        self.finalized_state().is_some()
    }

    async fn savepoint(&mut self) -> QueueResult<SavepointId>;

    async fn rollback_to_savepoint(&mut self, id: SavepointId) -> QueueResult<()>;

    /// Write domain columns of the leased record.
    async fn update(&mut self, assignments: Vec<Assignment>) -> QueueResult<()>;

    async fn mark_complete(&mut self) -> QueueResult<()>;

    async fn mark_errored(&mut self, failure: Failure) -> QueueResult<()>;

    /// Commit on `Ok`, roll back on `Err`.
    ///
    /// A caller error is handed back as `QueueError::Job`, combined with any
    /// rollback failure.
    async fn done(&mut self, result: anyhow::Result<()>) -> QueueResult<()>;
}

/// Plain transaction over a queue table, for batched writes.
#[async_trait]
pub trait QueueTransaction<P>: Send + 'static
where
    P: Send + Sync + 'static,
{
    async fn savepoint(&mut self) -> QueueResult<SavepointId>;

    async fn rollback_to_savepoint(&mut self, id: SavepointId) -> QueueResult<()>;

    async fn enqueue(&mut self, payload: &P, initial: InitialState) -> QueueResult<RecordId>;

    async fn done(&mut self, result: anyhow::Result<()>) -> QueueResult<()>;
}

/// Queue of one record kind.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    type Kind: RecordKind;
    type Lease: JobLease;
    type Transaction: QueueTransaction<<Self::Kind as RecordKind>::Payload>;

    /// Label used in logs and metric names.
    fn name(&self) -> &str;

    async fn enqueue(&self, payload: &PayloadOf<Self>, initial: InitialState)
    -> QueueResult<RecordId>;

    /// Promote an `uploading` record to `queued`. Returns `false` if the
    /// record does not exist or is not uploading.
    async fn mark_queued(&self, id: RecordId) -> QueueResult<bool>;

    /// Number of `queued` records.
    async fn queue_size(&self) -> QueueResult<u64>;

    /// Number of `queued` records, optionally counting `processing` ones too.
    async fn queued_count(&self, include_processing: bool) -> QueueResult<u64>;

    /// Whether a non-terminal record exists for the natural key.
    async fn is_queued(&self, key: &NaturalKey) -> QueueResult<bool>;

    async fn get_by_id(&self, id: RecordId) -> QueueResult<Option<Record<PayloadOf<Self>>>>;

    /// States of the given records; unknown ids are omitted.
    async fn get_states(&self, ids: &[RecordId]) -> QueueResult<HashMap<RecordId, RecordState>>;

    /// Claim the next record and lease it, or `None` when nothing is eligible.
    async fn dequeue(&self) -> QueueResult<Option<(Record<PayloadOf<Self>>, Self::Lease)>>;

    /// Return a record to the queue, not to be dequeued before `after`.
    async fn requeue(&self, id: RecordId, after: DateTime<Utc>) -> QueueResult<bool>;

    /// Requeue records stuck in `processing` longer than `stall_threshold`.
    async fn reset_stalled(
        &self,
        now: DateTime<Utc>,
        stall_threshold: Duration,
    ) -> QueueResult<ResetOutcome>;

    async fn transact(&self) -> QueueResult<Self::Transaction>;
}
