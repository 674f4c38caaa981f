//! Multi-worker properties of the queue: mutual exclusion, stall recovery,
//! skip-locked resets, rank ordering and bounded race retry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use dbworker_core::{
    Clock, InitialState, ManualClock, NaturalKey, QueueError, RecordId, RecordState, StoreResult,
    StoredRow, TableSpec, Upload, UploadJob, Value,
};
use dbworker_observability::MetricsRegistry;

use crate::backend::{
    Database, DatabaseTransaction, InMemoryDatabase, InMemoryTransaction, ResetOutcome,
    ResetRequest,
};
use crate::store::{DbQueueStore, DequeuePolicy, JobLease, QueueStore, StoreOptions};
use crate::workers::{Handler, Resetter, ResetterConfig, Worker, WorkerConfig};

const THRESHOLD: Duration = Duration::from_secs(5);

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn upload(commit: &str) -> UploadJob {
    UploadJob {
        repository_id: 42,
        commit: commit.to_string(),
        root: "".to_string(),
        indexer: "lsif-go".to_string(),
        num_parts: 1,
        upload_size: Some(512),
    }
}

fn uploads(db: &InMemoryDatabase, clock: &Arc<ManualClock>) -> DbQueueStore<Upload, InMemoryDatabase> {
    DbQueueStore::with_clock(Arc::new(db.clone()), clock.clone()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeues_lease_a_single_record_once() {
    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);
    let id = store.enqueue(&upload("a"), InitialState::Queued).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.dequeue().await.unwrap() })
        })
        .collect();

    let mut leases = Vec::new();
    for task in tasks {
        if let Some(found) = task.await.unwrap() {
            leases.push(found);
        }
    }

    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].0.id, id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_process_every_record_exactly_once() {
    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);
    let mut enqueued = HashSet::new();
    for i in 0..20 {
        let id = store
            .enqueue(&upload(&format!("{i:040}")), InitialState::Queued)
            .await
            .unwrap();
        enqueued.insert(id);
    }

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some((record, mut lease)) = store.dequeue().await.unwrap() {
                    seen.push(record.id);
                    lease.mark_complete().await.unwrap();
                    lease.done(Ok(())).await.unwrap();
                }
                seen
            })
        })
        .collect();

    let mut processed = Vec::new();
    for task in tasks {
        processed.extend(task.await.unwrap());
    }

    let unique: HashSet<RecordId> = processed.iter().copied().collect();
    assert_eq!(processed.len(), 20);
    assert_eq!(unique, enqueued);
    assert!(
        db.rows("lsif_uploads")
            .iter()
            .all(|row| row.state == RecordState::Completed)
    );
}

#[tokio::test]
async fn abandoned_lease_is_reset_after_the_stall_threshold() {
    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);
    let id = store.enqueue(&upload("a"), InitialState::Queued).await.unwrap();

    // Worker crashes: the lease is dropped without Done.
    let (_, lease) = store.dequeue().await.unwrap().unwrap();
    drop(lease);

    clock.set(t(0) + chrono::Duration::seconds(10));
    let outcome = store.reset_stalled(clock.now(), THRESHOLD).await.unwrap();
    assert_eq!(outcome.requeued, vec![id]);

    let record = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.state, RecordState::Queued);
    assert_eq!(record.started_at, None);
    assert_eq!(record.rank, Some(1));
}

#[tokio::test]
async fn live_lease_is_skipped_by_the_resetter() {
    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);
    let id = store.enqueue(&upload("a"), InitialState::Queued).await.unwrap();

    let (_, mut lease) = store.dequeue().await.unwrap().unwrap();
    clock.set(t(3600));
    assert!(store.reset_stalled(clock.now(), THRESHOLD).await.unwrap().is_empty());

    lease.mark_complete().await.unwrap();
    lease.done(Ok(())).await.unwrap();
    assert_eq!(
        store.get_by_id(id).await.unwrap().unwrap().state,
        RecordState::Completed
    );
}

#[tokio::test]
async fn rolling_back_past_mark_complete_leaves_record_unfinalized() {
    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);
    let id = store.enqueue(&upload("a"), InitialState::Queued).await.unwrap();

    let (_, mut lease) = store.dequeue().await.unwrap().unwrap();
    let savepoint = lease.savepoint().await.unwrap();
    lease.mark_complete().await.unwrap();
    lease.rollback_to_savepoint(savepoint).await.unwrap();

    let err = lease.done(Ok(())).await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFinalized));
    assert!(err.is_protocol_violation());
    assert!(matches!(
        lease.savepoint().await.unwrap_err(),
        QueueError::NoTransaction
    ));

    let record = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.state, RecordState::Processing);
    assert_eq!(record.finished_at, None);
}

#[tokio::test]
async fn ranks_follow_queue_order() {
    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);

    let mut ids = Vec::new();
    for i in 1..=5 {
        clock.set(t(i));
        ids.push(
            store
                .enqueue(&upload(&format!("c{i}")), InitialState::Queued)
                .await
                .unwrap(),
        );
    }
    for (rank, id) in ids.iter().enumerate() {
        let record = store.get_by_id(*id).await.unwrap().unwrap();
        assert_eq!(record.rank, Some(rank as u64 + 1));
    }

    let (first, _lease) = store.dequeue().await.unwrap().unwrap();
    assert_eq!(first.id, ids[0]);
    assert_eq!(first.rank, None);
    assert_eq!(store.get_by_id(ids[0]).await.unwrap().unwrap().rank, None);
    assert_eq!(store.get_by_id(ids[4]).await.unwrap().unwrap().rank, Some(4));
}

#[tokio::test]
async fn open_lease_survives_reset_and_next_dequeue_takes_the_following_record() {
    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);

    let a = store.enqueue(&upload("a"), InitialState::Queued).await.unwrap();
    clock.set(t(1));
    let b = store.enqueue(&upload("b"), InitialState::Queued).await.unwrap();

    let (first, _lease_a) = store.dequeue().await.unwrap().unwrap();
    assert_eq!(first.id, a);

    clock.set(t(2));
    let outcome = store.reset_stalled(clock.now(), THRESHOLD).await.unwrap();
    assert!(outcome.is_empty());
    assert_eq!(
        store.get_by_id(a).await.unwrap().unwrap().state,
        RecordState::Processing
    );

    let (second, _lease_b) = store.dequeue().await.unwrap().unwrap();
    assert_eq!(second.id, b);
}

#[tokio::test]
async fn crashed_work_is_reprocessed_by_a_worker() {
    struct Complete;

    #[async_trait]
    impl Handler<UploadJob> for Complete {
        async fn handle(
            &self,
            _: &dbworker_core::Record<UploadJob>,
            _: &mut dyn JobLease,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);
    let registry = MetricsRegistry::new();
    let id = store.enqueue(&upload("a"), InitialState::Queued).await.unwrap();
    drop(store.dequeue().await.unwrap());

    let resetter = Resetter::new(
        store.clone(),
        ResetterConfig::default().with_stall_threshold(THRESHOLD),
        &registry,
    )
    .with_clock(clock.clone());
    let worker = Worker::new(store.clone(), Complete);
    let config = WorkerConfig::default();

    assert!(!worker.process_one(&config).await);
    clock.set(t(30));
    resetter.run_once().await.unwrap();
    assert!(worker.process_one(&config).await);

    let record = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.state, RecordState::Completed);
    assert_eq!(record.num_resets, 1);
    assert_eq!(registry.snapshot().counters["uploads.records_reset_total"], 1);
}

/// Database whose claims are followed by a competing lock on the claimed row.
#[derive(Debug, Clone)]
struct RacingDatabase {
    inner: InMemoryDatabase,
    races: Arc<AtomicU32>,
    holders: Arc<Mutex<Vec<InMemoryTransaction>>>,
}

impl RacingDatabase {
    fn new(races: u32) -> Self {
        Self {
            inner: InMemoryDatabase::new(),
            races: Arc::new(AtomicU32::new(races)),
            holders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn release(&self) {
        self.holders.lock().unwrap().clear();
    }
}

#[async_trait]
impl Database for RacingDatabase {
    type Tx = InMemoryTransaction;

    async fn insert(
        &self,
        table: &TableSpec,
        state: RecordState,
        values: &[Value],
        now: DateTime<Utc>,
    ) -> StoreResult<RecordId> {
        self.inner.insert(table, state, values, now).await
    }

    async fn claim_next(
        &self,
        table: &TableSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RecordId>> {
        let claimed = self.inner.claim_next(table, now).await?;
        if let Some(id) = claimed {
            let raced = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if raced {
                let mut racer = self.inner.begin().await?;
                racer.lock(table, id).await?;
                self.holders.lock().unwrap().push(racer);
            }
        }
        Ok(claimed)
    }

    async fn begin(&self) -> StoreResult<InMemoryTransaction> {
        self.inner.begin().await
    }

    async fn fetch(&self, table: &TableSpec, id: RecordId) -> StoreResult<Option<StoredRow>> {
        self.inner.fetch(table, id).await
    }

    async fn count(&self, table: &TableSpec, states: &[RecordState]) -> StoreResult<u64> {
        self.inner.count(table, states).await
    }

    async fn exists(
        &self,
        table: &TableSpec,
        states: &[RecordState],
        key: &NaturalKey,
    ) -> StoreResult<bool> {
        self.inner.exists(table, states, key).await
    }

    async fn states(
        &self,
        table: &TableSpec,
        ids: &[RecordId],
    ) -> StoreResult<Vec<(RecordId, RecordState)>> {
        self.inner.states(table, ids).await
    }

    async fn requeue(
        &self,
        table: &TableSpec,
        id: RecordId,
        after: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.requeue(table, id, after).await
    }

    async fn mark_queued(
        &self,
        table: &TableSpec,
        id: RecordId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.mark_queued(table, id, now).await
    }

    async fn reset_stalled(
        &self,
        table: &TableSpec,
        request: &ResetRequest,
    ) -> StoreResult<ResetOutcome> {
        self.inner.reset_stalled(table, request).await
    }
}

fn racing_store(
    db: &RacingDatabase,
    clock: &Arc<ManualClock>,
    attempts: u32,
) -> DbQueueStore<Upload, RacingDatabase> {
    let policy = DequeuePolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(1));
    DbQueueStore::with_clock(Arc::new(db.clone()), clock.clone())
        .unwrap()
        .with_options(StoreOptions::default().with_dequeue_policy(policy))
}

#[tokio::test(start_paused = true)]
async fn lost_race_retries_with_the_next_record() {
    let db = RacingDatabase::new(1);
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = racing_store(&db, &clock, 5);
    let a = store.enqueue(&upload("a"), InitialState::Queued).await.unwrap();
    let b = store.enqueue(&upload("b"), InitialState::Queued).await.unwrap();

    let (record, _lease) = store.dequeue().await.unwrap().unwrap();
    assert_eq!(record.id, b);

    // The record claimed by the lost race is left for the resetter.
    db.release();
    assert_eq!(
        store.get_by_id(a).await.unwrap().unwrap().state,
        RecordState::Processing
    );
}

#[tokio::test(start_paused = true)]
async fn persistent_races_surface_as_contention() {
    let db = RacingDatabase::new(u32::MAX);
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = racing_store(&db, &clock, 3);
    for i in 0..5 {
        store
            .enqueue(&upload(&format!("r{i}")), InitialState::Queued)
            .await
            .unwrap();
    }

    let err = store.dequeue().await.map(|found| found.is_some()).unwrap_err();
    assert!(matches!(err, QueueError::DequeueContention { attempts: 3 }));
    assert!(err.is_transient());
    assert_eq!(store.queue_size().await.unwrap(), 2);
}

#[tokio::test]
async fn caller_and_rollback_errors_are_both_reported() {
    let db = InMemoryDatabase::new();
    let clock = Arc::new(ManualClock::new(t(0)));
    let store = uploads(&db, &clock);
    store.enqueue(&upload("a"), InitialState::Queued).await.unwrap();

    let (_, mut lease) = store.dequeue().await.unwrap().unwrap();
    lease.mark_complete().await.unwrap();
    db.set_unavailable(true);

    let err = lease
        .done(Err(anyhow::anyhow!("conversion failed")))
        .await
        .unwrap_err();
    let QueueError::Aggregate(errors) = &err else {
        panic!("expected aggregate, got {err:?}");
    };
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|e| matches!(e, QueueError::Job(_))));
    assert!(errors.iter().any(|e| e.is_transient()));
    assert!(err.to_string().contains("conversion failed"));
}
