//! Metrics and tracing around any [`QueueStore`].
//!
//! Every operation runs inside a span and records its latency, result size and
//! failure into an [`OperationMetrics`] named `{queue}.{operation}`. Results
//! are returned untouched.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, info_span, warn};

use dbworker_core::{
    Failure, InitialState, NaturalKey, QueueError, QueueResult, Record, RecordId, RecordState,
    SavepointId,
};
use dbworker_observability::{MetricsRegistry, OperationMetrics};

use crate::backend::{Assignment, ResetOutcome};

use super::r#trait::{JobLease, PayloadOf, QueueStore, QueueTransaction};

/// Records operations of one queue into a registry.
#[derive(Debug, Clone)]
struct Observer {
    queue: Arc<str>,
    registry: Arc<MetricsRegistry>,
}

impl Observer {
    fn metrics(&self, op: &str) -> Arc<OperationMetrics> {
        self.registry.operation(&format!("{}.{}", self.queue, op))
    }

    async fn observe<T, F>(
        &self,
        op: &'static str,
        items: impl Fn(&T) -> u64 + Send,
        fut: F,
    ) -> QueueResult<T>
    where
        F: Future<Output = QueueResult<T>> + Send,
        T: Send,
    {
        self.observe_with(op, items, |_| true, fut).await
    }

    /// Like `observe`, but only errors for which `counts` holds are recorded
    /// as failures.
    async fn observe_with<T, F>(
        &self,
        op: &'static str,
        items: impl Fn(&T) -> u64 + Send,
        counts: impl Fn(&QueueError) -> bool + Send,
        fut: F,
    ) -> QueueResult<T>
    where
        F: Future<Output = QueueResult<T>> + Send,
        T: Send,
    {
        let span = info_span!("queue_operation", queue = %self.queue, op);
        let started = Instant::now();
        let result = fut.instrument(span.clone()).await;
        let elapsed = started.elapsed();

        let (count, failed) = match &result {
            Ok(value) => (items(value), false),
            Err(err) => (0, counts(err)),
        };
        self.metrics(op).observe(elapsed, count, failed);

        if let Err(err) = &result {
            span.in_scope(|| {
                if failed {
                    warn!(queue = %self.queue, op, error = %err, "queue operation failed");
                } else {
                    debug!(queue = %self.queue, op, error = %err, "queue operation returned caller error");
                }
            });
        }
        result
    }
}

fn one<T>(_: &T) -> u64 {
    1
}

fn none<T>(_: &T) -> u64 {
    0
}

/// [`QueueStore`] decorator that records per-operation metrics and spans.
#[derive(Debug, Clone)]
pub struct ObservedStore<S> {
    inner: S,
    observer: Observer,
}

impl<S: QueueStore> ObservedStore<S> {
    pub fn new(inner: S, registry: Arc<MetricsRegistry>) -> Self {
        let queue: Arc<str> = Arc::from(inner.name());
        Self {
            inner,
            observer: Observer { queue, registry },
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.observer.registry
    }
}

/// Emits the `QueueStore` impl: listed operations forward through
/// `Observer::observe`, the rest are written out in the trailing block.
macro_rules! observed_store {
    (
        $(
            fn $method:ident(&self $(, $arg:ident: $ty:ty)*) -> $ret:ty, items = $items:expr;
        )*
        { $($extra:tt)* }
    ) => {
        #[async_trait]
        impl<S: QueueStore> QueueStore for ObservedStore<S> {
            type Kind = S::Kind;
            type Lease = ObservedLease<S::Lease>;
            type Transaction = ObservedTransaction<S::Transaction>;

            fn name(&self) -> &str {
                self.inner.name()
            }

            $(
                async fn $method(&self $(, $arg: $ty)*) -> QueueResult<$ret> {
                    self.observer
                        .observe(stringify!($method), $items, self.inner.$method($($arg),*))
                        .await
                }
            )*

            $($extra)*
        }
    };
}

observed_store! {
    fn enqueue(&self, payload: &PayloadOf<Self>, initial: InitialState) -> RecordId, items = one;
    fn mark_queued(&self, id: RecordId) -> bool, items = |updated: &bool| u64::from(*updated);
    fn queued_count(&self, include_processing: bool) -> u64, items = none;
    fn is_queued(&self, key: &NaturalKey) -> bool, items = none;
    fn get_by_id(&self, id: RecordId) -> Option<Record<PayloadOf<Self>>>,
        items = |found: &Option<Record<PayloadOf<Self>>>| u64::from(found.is_some());
    fn get_states(&self, ids: &[RecordId]) -> HashMap<RecordId, RecordState>,
        items = |states: &HashMap<RecordId, RecordState>| states.len() as u64;
    fn requeue(&self, id: RecordId, after: DateTime<Utc>) -> bool,
        items = |updated: &bool| u64::from(*updated);
    fn reset_stalled(&self, now: DateTime<Utc>, stall_threshold: Duration) -> ResetOutcome,
        items = |outcome: &ResetOutcome| outcome.total() as u64;
    {
        async fn queue_size(&self) -> QueueResult<u64> {
            let size = self
                .observer
                .observe("queue_size", none, self.inner.queue_size())
                .await?;
            self.observer
                .registry
                .gauge(&format!("{}.queue_size", self.observer.queue))
                .set(i64::try_from(size).unwrap_or(i64::MAX));
            Ok(size)
        }

        async fn dequeue(&self) -> QueueResult<Option<(Record<PayloadOf<Self>>, Self::Lease)>> {
            let dequeued = self
                .observer
                .observe(
                    "dequeue",
                    |found: &Option<(Record<PayloadOf<Self>>, S::Lease)>| u64::from(found.is_some()),
                    self.inner.dequeue(),
                )
                .await?;
            Ok(dequeued.map(|(record, lease)| {
                (record, ObservedLease::new(lease, self.observer.clone()))
            }))
        }

        async fn transact(&self) -> QueueResult<Self::Transaction> {
            let tx = self
                .observer
                .observe("transact", none, self.inner.transact())
                .await?;
            Ok(ObservedTransaction {
                inner: tx,
                observer: self.observer.clone(),
            })
        }
    }
}

/// Caller errors handed back by `done` are not failures of the store.
fn counts_as_failure(err: &QueueError) -> bool {
    !err.is_passthrough()
}

/// [`JobLease`] wrapper returned by [`ObservedStore::dequeue`].
#[derive(Debug)]
pub struct ObservedLease<L> {
    inner: L,
    observer: Observer,
}

impl<L: JobLease> ObservedLease<L> {
    fn new(inner: L, observer: Observer) -> Self {
        Self { inner, observer }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: JobLease> JobLease for ObservedLease<L> {
    fn record_id(&self) -> RecordId {
        self.inner.record_id()
    }

    fn finalized_state(&self) -> Option<RecordState> {
        self.inner.finalized_state()
    }

    async fn savepoint(&mut self) -> QueueResult<SavepointId> {
        self.observer
            .observe("lease.savepoint", none, self.inner.savepoint())
            .await
    }

    async fn rollback_to_savepoint(&mut self, id: SavepointId) -> QueueResult<()> {
        self.observer
            .observe(
                "lease.rollback_to_savepoint",
                none,
                self.inner.rollback_to_savepoint(id),
            )
            .await
    }

    async fn update(&mut self, assignments: Vec<Assignment>) -> QueueResult<()> {
        let columns = assignments.len() as u64;
        self.observer
            .observe("lease.update", move |_| columns, self.inner.update(assignments))
            .await
    }

    async fn mark_complete(&mut self) -> QueueResult<()> {
        self.observer
            .observe("lease.mark_complete", one, self.inner.mark_complete())
            .await
    }

    async fn mark_errored(&mut self, failure: Failure) -> QueueResult<()> {
        self.observer
            .observe("lease.mark_errored", one, self.inner.mark_errored(failure))
            .await
    }

    async fn done(&mut self, result: anyhow::Result<()>) -> QueueResult<()> {
        self.observer
            .observe_with("lease.done", none, counts_as_failure, self.inner.done(result))
            .await
    }
}

/// [`QueueTransaction`] wrapper returned by [`ObservedStore::transact`].
#[derive(Debug)]
pub struct ObservedTransaction<T> {
    inner: T,
    observer: Observer,
}

#[async_trait]
impl<P, T> QueueTransaction<P> for ObservedTransaction<T>
where
    P: Send + Sync + 'static,
    T: QueueTransaction<P>,
{
    async fn savepoint(&mut self) -> QueueResult<SavepointId> {
        self.observer
            .observe("tx.savepoint", none, self.inner.savepoint())
            .await
    }

    async fn rollback_to_savepoint(&mut self, id: SavepointId) -> QueueResult<()> {
        self.observer
            .observe(
                "tx.rollback_to_savepoint",
                none,
                self.inner.rollback_to_savepoint(id),
            )
            .await
    }

    async fn enqueue(&mut self, payload: &P, initial: InitialState) -> QueueResult<RecordId> {
        self.observer
            .observe("tx.enqueue", one, self.inner.enqueue(payload, initial))
            .await
    }

    async fn done(&mut self, result: anyhow::Result<()>) -> QueueResult<()> {
        self.observer
            .observe_with("tx.done", none, counts_as_failure, self.inner.done(result))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dbworker_core::{Index, IndexJob, ManualClock};

    use crate::backend::InMemoryDatabase;
    use crate::store::DbQueueStore;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn job(commit: &str) -> IndexJob {
        IndexJob {
            repository_id: 3,
            commit: commit.to_string(),
            docker_image: "sourcegraph/scip-go".to_string(),
            root: None,
        }
    }

    fn observed() -> (
        ObservedStore<DbQueueStore<Index, InMemoryDatabase>>,
        InMemoryDatabase,
    ) {
        let db = InMemoryDatabase::new();
        let clock = Arc::new(ManualClock::new(t(0)));
        let store = DbQueueStore::with_clock(Arc::new(db.clone()), clock).unwrap();
        (
            ObservedStore::new(store, Arc::new(MetricsRegistry::new())),
            db,
        )
    }

    #[tokio::test]
    async fn operations_are_recorded_per_queue() {
        let (store, _) = observed();
        store.enqueue(&job("a"), InitialState::Queued).await.unwrap();
        store.enqueue(&job("b"), InitialState::Queued).await.unwrap();
        assert_eq!(store.queue_size().await.unwrap(), 2);

        let snapshot = store.registry().snapshot();
        assert_eq!(snapshot.operations["indexes.enqueue"].calls, 2);
        assert_eq!(snapshot.operations["indexes.enqueue"].items, 2);
        assert_eq!(snapshot.operations["indexes.queue_size"].calls, 1);
        assert_eq!(snapshot.gauges["indexes.queue_size"], 2);
    }

    #[tokio::test]
    async fn store_failures_are_counted() {
        let (store, db) = observed();
        db.set_unavailable(true);
        let err = store.queued_count(true).await.unwrap_err();
        assert!(err.is_transient());

        let snapshot = store.registry().snapshot();
        assert_eq!(snapshot.operations["indexes.queued_count"].errors, 1);
    }

    #[tokio::test]
    async fn lease_is_wrapped_and_caller_errors_are_not_failures() {
        let (store, _) = observed();
        store.enqueue(&job("a"), InitialState::Queued).await.unwrap();

        let (record, mut lease) = store.dequeue().await.unwrap().unwrap();
        assert_eq!(lease.record_id(), record.id);
        lease.mark_complete().await.unwrap();
        let err = lease.done(Err(anyhow::anyhow!("handler gave up"))).await.unwrap_err();
        assert!(err.is_passthrough());

        let snapshot = store.registry().snapshot();
        assert_eq!(snapshot.operations["indexes.dequeue"].items, 1);
        assert_eq!(snapshot.operations["indexes.lease.mark_complete"].calls, 1);
        assert_eq!(snapshot.operations["indexes.lease.done"].calls, 1);
        assert_eq!(snapshot.operations["indexes.lease.done"].errors, 0);
    }

    #[tokio::test]
    async fn protocol_errors_in_done_are_failures() {
        let (store, _) = observed();
        store.enqueue(&job("a"), InitialState::Queued).await.unwrap();

        let (_, mut lease) = store.dequeue().await.unwrap().unwrap();
        let err = lease.done(Ok(())).await.unwrap_err();
        assert!(matches!(err, QueueError::JobNotFinalized));

        let snapshot = store.registry().snapshot();
        assert_eq!(snapshot.operations["indexes.lease.done"].errors, 1);
    }

    #[tokio::test]
    async fn transactions_are_wrapped() {
        let (store, _) = observed();
        let mut tx = store.transact().await.unwrap();
        tx.enqueue(&job("a"), InitialState::Queued).await.unwrap();
        tx.done(Ok(())).await.unwrap();

        assert_eq!(store.queue_size().await.unwrap(), 1);
        let snapshot = store.registry().snapshot();
        assert_eq!(snapshot.operations["indexes.tx.enqueue"].items, 1);
        assert_eq!(snapshot.operations["indexes.tx.done"].calls, 1);
    }
}
