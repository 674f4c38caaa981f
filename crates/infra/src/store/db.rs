//! [`QueueStore`] over a relational [`Database`].

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use dbworker_core::{
    Clock, InitialState, NaturalKey, QueueError, QueueResult, Record, RecordId, RecordKind,
    RecordState, StoreError, SystemClock, TableSpec,
};

use crate::backend::{Database, DatabaseTransaction, ResetOutcome, ResetRequest};

use super::dequeue::{DequeuePolicy, claim_and_lock};
use super::handle::{EnqueueHandle, JobHandle, TxHandle};
use super::r#trait::{PayloadOf, QueueStore};

/// Failure summary written to records that exhaust their reset budget.
pub const RESET_FAILURE_SUMMARY: &str = "failed to process";

/// States counted by `is_queued`.
const NON_TERMINAL: [RecordState; 3] = [
    RecordState::Uploading,
    RecordState::Queued,
    RecordState::Processing,
];

/// Tuning knobs of a [`DbQueueStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    /// Resets a record may take before the resetter errors it.
    pub max_num_resets: u32,
    pub dequeue: DequeuePolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_num_resets: 3,
            dequeue: DequeuePolicy::default(),
        }
    }
}

impl StoreOptions {
    pub fn with_max_num_resets(mut self, max: u32) -> Self {
        self.max_num_resets = max;
        self
    }

    pub fn with_dequeue_policy(mut self, policy: DequeuePolicy) -> Self {
        self.dequeue = policy;
        self
    }
}

/// Queue of record kind `K` stored in database `D`.
pub struct DbQueueStore<K: RecordKind, D: Database> {
    db: Arc<D>,
    table: Arc<TableSpec>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    _kind: PhantomData<fn() -> K>,
}

impl<K: RecordKind, D: Database> Clone for DbQueueStore<K, D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            table: Arc::clone(&self.table),
            clock: Arc::clone(&self.clock),
            options: self.options.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: RecordKind, D: Database> fmt::Debug for DbQueueStore<K, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbQueueStore")
            .field("kind", &K::NAME)
            .field("table", &self.table.name())
            .field("options", &self.options)
            .finish()
    }
}

impl<K: RecordKind, D: Database> DbQueueStore<K, D> {
    /// Build a store for `K`. Fails when the kind's table spec is invalid.
    pub fn new(db: Arc<D>) -> Result<Self, StoreError> {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Arc<D>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let table = K::table();
        table.validate()?;
        Ok(Self {
            db,
            table: Arc::new(table),
            clock,
            options: StoreOptions::default(),
            _kind: PhantomData,
        })
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    fn tx_handle(&self, tx: D::Tx) -> TxHandle<D::Tx> {
        TxHandle::new(tx, Arc::clone(&self.table), Arc::clone(&self.clock))
    }
}

#[async_trait]
impl<K, D> QueueStore for DbQueueStore<K, D>
where
    K: RecordKind,
    D: Database,
{
    type Kind = K;
    type Lease = JobHandle<D::Tx>;
    type Transaction = EnqueueHandle<K, D::Tx>;

    fn name(&self) -> &str {
        K::NAME
    }

    #[instrument(skip(self, payload), fields(queue = K::NAME), err)]
    async fn enqueue(&self, payload: &K::Payload, initial: InitialState) -> QueueResult<RecordId> {
        let values = K::encode(payload);
        let state = RecordState::from(initial);
        let id = self
            .db
            .insert(&self.table, state, &values, self.clock.now())
            .await?;
        debug!(queue = K::NAME, record_id = %id, state = %state, "enqueued record");
        Ok(id)
    }

    async fn mark_queued(&self, id: RecordId) -> QueueResult<bool> {
        let updated = self
            .db
            .mark_queued(&self.table, id, self.clock.now())
            .await?;
        if updated {
            debug!(queue = K::NAME, record_id = %id, "marked record queued");
        }
        Ok(updated)
    }

    async fn queue_size(&self) -> QueueResult<u64> {
        Ok(self.db.count(&self.table, &[RecordState::Queued]).await?)
    }

    async fn queued_count(&self, include_processing: bool) -> QueueResult<u64> {
        let states: &[RecordState] = if include_processing {
            &[RecordState::Queued, RecordState::Processing]
        } else {
            &[RecordState::Queued]
        };
        Ok(self.db.count(&self.table, states).await?)
    }

    async fn is_queued(&self, key: &NaturalKey) -> QueueResult<bool> {
        self.table.check_key(key)?;
        Ok(self.db.exists(&self.table, &NON_TERMINAL, key).await?)
    }

    async fn get_by_id(&self, id: RecordId) -> QueueResult<Option<Record<K::Payload>>> {
        let Some(row) = self.db.fetch(&self.table, id).await? else {
            return Ok(None);
        };
        Ok(Some(Record::decode::<K>(row)?))
    }

    async fn get_states(&self, ids: &[RecordId]) -> QueueResult<HashMap<RecordId, RecordState>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self
            .db
            .states(&self.table, ids)
            .await?
            .into_iter()
            .collect())
    }

    #[instrument(skip(self), fields(queue = K::NAME), err)]
    async fn dequeue(&self) -> QueueResult<Option<(Record<PayloadOf<Self>>, Self::Lease)>> {
        let claimed = claim_and_lock(
            self.db.as_ref(),
            &self.table,
            self.clock.as_ref(),
            &self.options.dequeue,
            K::NAME,
        )
        .await?;
        let Some((row, tx)) = claimed else {
            return Ok(None);
        };

        let record = match Record::decode::<K>(row) {
            Ok(record) => record,
            Err(err) => {
                // The claim stays committed; the resetter returns the row later.
                let primary = QueueError::from(err);
                return Err(match tx.rollback().await {
                    Ok(()) => primary,
                    Err(rollback) => QueueError::aggregate(primary, rollback.into()),
                });
            }
        };

        let lease = JobHandle::new(self.tx_handle(tx), record.id, K::NAME);
        Ok(Some((record, lease)))
    }

    async fn requeue(&self, id: RecordId, after: DateTime<Utc>) -> QueueResult<bool> {
        let updated = self.db.requeue(&self.table, id, after).await?;
        if updated {
            debug!(queue = K::NAME, record_id = %id, process_after = %after, "requeued record");
        }
        Ok(updated)
    }

    #[instrument(skip(self), fields(queue = K::NAME), err)]
    async fn reset_stalled(
        &self,
        now: DateTime<Utc>,
        stall_threshold: Duration,
    ) -> QueueResult<ResetOutcome> {
        // An out-of-range threshold means nothing is old enough to count as stalled.
        let cutoff = chrono::Duration::from_std(stall_threshold)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let request = ResetRequest {
            cutoff,
            now,
            max_num_resets: self.options.max_num_resets,
            failure_summary: RESET_FAILURE_SUMMARY.to_string(),
        };

        let outcome = self.db.reset_stalled(&self.table, &request).await?;
        for id in &outcome.requeued {
            info!(queue = K::NAME, record_id = %id, "reset stalled record");
        }
        for id in &outcome.errored {
            info!(queue = K::NAME, record_id = %id, "errored record after exhausting resets");
        }
        Ok(outcome)
    }

    async fn transact(&self) -> QueueResult<Self::Transaction> {
        let tx = self.db.begin().await?;
        Ok(EnqueueHandle::new(self.tx_handle(tx)))
    }
}
