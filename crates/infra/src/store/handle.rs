//! Transaction handles returned by the queue store.
//!
//! [`TxHandle`] owns the database transaction and its savepoint stack.
//! [`JobHandle`] adds the leased record and the finalize-before-commit rule.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use dbworker_core::{
    Clock, ErrorList, Failure, InitialState, QueueError, QueueResult, RecordId, RecordKind,
    RecordState, SavepointId, SavepointStack, TableSpec,
};

use crate::backend::{Assignment, DatabaseTransaction};

use super::r#trait::{JobLease, QueueTransaction};

/// Transaction with a savepoint stack.
#[derive(Debug)]
pub struct TxHandle<T: DatabaseTransaction> {
    tx: Option<T>,
    savepoints: SavepointStack,
    table: Arc<TableSpec>,
    clock: Arc<dyn Clock>,
}

impl<T: DatabaseTransaction> TxHandle<T> {
    pub(crate) fn new(tx: T, table: Arc<TableSpec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tx: Some(tx),
            savepoints: SavepointStack::new(),
            table,
            clock,
        }
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.depth()
    }

    fn tx_mut(&mut self) -> QueueResult<&mut T> {
        self.tx.as_mut().ok_or(QueueError::NoTransaction)
    }

    pub async fn savepoint(&mut self) -> QueueResult<SavepointId> {
        let id = self.savepoints.allocate();
        self.tx_mut()?.savepoint(&id.sql_name()).await?;
        self.savepoints.push(id);
        Ok(id)
    }

    /// Undo writes since `id` and pop it along with every later savepoint.
    ///
    /// Returns whether the rollback undid the record's finalization.
    pub async fn rollback_to_savepoint(&mut self, id: SavepointId) -> QueueResult<bool> {
        if self.tx.is_none() {
            return Err(QueueError::NoTransaction);
        }
        self.savepoints.position(id)?;
        self.tx_mut()?.rollback_to_savepoint(&id.sql_name()).await?;
        let rollback = self.savepoints.rollback_to(id)?;
        Ok(rollback.cleared_finalized)
    }

    pub(crate) async fn insert(
        &mut self,
        state: RecordState,
        values: &[dbworker_core::Value],
    ) -> QueueResult<RecordId> {
        let now = self.clock.now();
        let table = Arc::clone(&self.table);
        Ok(self.tx_mut()?.insert(&table, state, values, now).await?)
    }

    /// Commit on `Ok`, roll back on `Err`. Closes the handle either way.
    pub async fn done(&mut self, result: anyhow::Result<()>) -> QueueResult<()> {
        let tx = self.tx.take().ok_or(QueueError::NoTransaction)?;
        match result {
            Ok(()) => Ok(tx.commit().await?),
            Err(err) => {
                let mut errors = ErrorList::default();
                errors.push(QueueError::Job(err));
                if let Err(rollback) = tx.rollback().await {
                    errors.push(rollback.into());
                }
                Err(errors.into_error().unwrap_or(QueueError::NoTransaction))
            }
        }
    }

    /// Roll back and close, reporting `primary` together with any rollback failure.
    async fn abort(&mut self, primary: QueueError) -> QueueError {
        let Some(tx) = self.tx.take() else {
            return primary;
        };
        match tx.rollback().await {
            Ok(()) => primary,
            Err(rollback) => QueueError::aggregate(primary, rollback.into()),
        }
    }
}

/// Transaction handle for batched enqueues of record kind `K`.
#[derive(Debug)]
pub struct EnqueueHandle<K: RecordKind, T: DatabaseTransaction> {
    inner: TxHandle<T>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: RecordKind, T: DatabaseTransaction> EnqueueHandle<K, T> {
    pub(crate) fn new(inner: TxHandle<T>) -> Self {
        Self {
            inner,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K, T> QueueTransaction<K::Payload> for EnqueueHandle<K, T>
where
    K: RecordKind,
    T: DatabaseTransaction,
{
    async fn savepoint(&mut self) -> QueueResult<SavepointId> {
        self.inner.savepoint().await
    }

    async fn rollback_to_savepoint(&mut self, id: SavepointId) -> QueueResult<()> {
        self.inner.rollback_to_savepoint(id).await.map(|_| ())
    }

    async fn enqueue(&mut self, payload: &K::Payload, initial: InitialState) -> QueueResult<RecordId> {
        let values = K::encode(payload);
        self.inner.insert(initial.into(), &values).await
    }

    async fn done(&mut self, result: anyhow::Result<()>) -> QueueResult<()> {
        self.inner.done(result).await
    }
}

/// Lease on one dequeued record.
#[derive(Debug)]
pub struct JobHandle<T: DatabaseTransaction> {
    inner: TxHandle<T>,
    record_id: RecordId,
    queue: String,
}

impl<T: DatabaseTransaction> JobHandle<T> {
    pub(crate) fn new(inner: TxHandle<T>, record_id: RecordId, queue: impl Into<String>) -> Self {
        Self {
            inner,
            record_id,
            queue: queue.into(),
        }
    }

    async fn finalize(&mut self, state: RecordState, failure: Option<Failure>) -> QueueResult<()> {
        let now = self.inner.clock.now();
        let table = Arc::clone(&self.inner.table);
        let record_id = self.record_id;
        let updated = self
            .inner
            .tx_mut()?
            .finalize(&table, record_id, state, failure.as_ref(), now)
            .await?;
        if !updated {
            return Err(QueueError::LeaseLost(record_id));
        }

        self.inner.savepoints.mark_finalized(state);
        debug!(
            queue = %self.queue,
            record_id = %record_id,
            state = %state,
            depth = self.inner.savepoint_depth(),
            "marked record"
        );
        Ok(())
    }
}

#[async_trait]
impl<T: DatabaseTransaction> JobLease for JobHandle<T> {
    fn record_id(&self) -> RecordId {
        self.record_id
    }

    fn finalized_state(&self) -> Option<RecordState> {
        self.inner.savepoints.finalized_state()
    }

    async fn savepoint(&mut self) -> QueueResult<SavepointId> {
        self.inner.savepoint().await
    }

    async fn rollback_to_savepoint(&mut self, id: SavepointId) -> QueueResult<()> {
        let cleared = self.inner.rollback_to_savepoint(id).await?;
        if cleared {
            debug!(
                queue = %self.queue,
                record_id = %self.record_id,
                savepoint = %id,
                "rollback undid record finalization"
            );
        }
        Ok(())
    }

    async fn update(&mut self, assignments: Vec<Assignment>) -> QueueResult<()> {
        for (column, value) in &assignments {
            let fits = self
                .inner
                .table
                .column_index(column)
                .map(|i| &self.inner.table.columns()[i])
                .is_some_and(|c| value.fits(c.ty, c.nullable));
            if !fits {
                return Err(QueueError::InvalidAssignment(format!(
                    "{} = {:?} on {}",
                    column,
                    value,
                    self.inner.table.name()
                )));
            }
        }

        let table = Arc::clone(&self.inner.table);
        let record_id = self.record_id;
        let updated = self
            .inner
            .tx_mut()?
            .update(&table, record_id, &assignments)
            .await?;
        if !updated {
            return Err(QueueError::LeaseLost(record_id));
        }
        Ok(())
    }

    async fn mark_complete(&mut self) -> QueueResult<()> {
        self.finalize(RecordState::Completed, None).await
    }

    async fn mark_errored(&mut self, failure: Failure) -> QueueResult<()> {
        self.finalize(RecordState::Errored, Some(failure)).await
    }

    async fn done(&mut self, result: anyhow::Result<()>) -> QueueResult<()> {
        if !self.inner.is_open() {
            return Err(QueueError::NoTransaction);
        }

        if !self.is_finalized() {
            warn!(
                queue = %self.queue,
                record_id = %self.record_id,
                "job handle closed without finalizing the record"
            );
            let primary = match result {
                Ok(()) => QueueError::JobNotFinalized,
                Err(err) => QueueError::aggregate(QueueError::Job(err), QueueError::JobNotFinalized),
            };
            return Err(self.inner.abort(primary).await);
        }

        self.inner.done(result).await
    }
}
