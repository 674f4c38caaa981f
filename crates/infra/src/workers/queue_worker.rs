//! Polling worker: dequeue, handle, finalize, commit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use dbworker_core::{Failure, Record, RecordState};

use crate::store::{JobLease, PayloadOf, QueueStore};

use super::shutdown::{Shutdown, StopListener, WorkerHandle};

/// Domain logic run for each dequeued record.
///
/// The handler may write through `lease` and may finalize the record itself.
/// When it returns `Ok` without finalizing, the worker marks the record
/// complete; when it returns `Err`, the worker marks it errored.
#[async_trait]
pub trait Handler<P>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
{
    async fn handle(&self, record: &Record<P>, lease: &mut dyn JobLease) -> anyhow::Result<()>;
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty or unavailable
    pub poll_interval: Duration,
    /// Number of concurrent poll loops
    pub concurrency: usize,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            concurrency: 1,
            name: "queue-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub records_processed: u64,
    pub records_completed: u64,
    pub records_errored: u64,
    /// Dequeue calls that failed
    pub dequeue_errors: u64,
    /// Records whose mark or commit failed
    pub finalize_errors: u64,
    pub current_running: usize,
}

/// Background worker for one queue.
pub struct Worker<S: QueueStore, H> {
    store: Arc<S>,
    handler: Arc<H>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S, H> Worker<S, H>
where
    S: QueueStore,
    H: Handler<PayloadOf<S>>,
{
    pub fn new(store: S, handler: H) -> Self {
        Self {
            store: Arc::new(store),
            handler: Arc::new(handler),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Dequeue and process at most one record. Returns whether one was found.
    pub async fn process_one(&self, config: &WorkerConfig) -> bool {
        match self.store.dequeue().await {
            Ok(Some((record, lease))) => {
                self.process(config, record, lease).await;
                true
            }
            Ok(None) => false,
            Err(err) => {
                lock_stats(&self.stats).dequeue_errors += 1;
                error!(worker = %config.name, queue = self.store.name(), error = %err, "failed to dequeue record");
                false
            }
        }
    }

    async fn process(&self, config: &WorkerConfig, record: Record<PayloadOf<S>>, mut lease: S::Lease) {
        lock_stats(&self.stats).current_running += 1;
        debug!(worker = %config.name, queue = self.store.name(), record_id = %record.id, "processing record");

        let result = self.handler.handle(&record, &mut lease).await;

        let marked = match result {
            Ok(()) if lease.is_finalized() => Ok(()),
            Ok(()) => lease.mark_complete().await,
            Err(err) => {
                warn!(
                    worker = %config.name,
                    queue = self.store.name(),
                    record_id = %record.id,
                    error = %format!("{err:#}"),
                    "handler failed"
                );
                lease.mark_errored(Failure::from(&err)).await
            }
        };

        // Read before `done`: the lease forgets its marks once closed.
        let written = lease.finalized_state();
        let closed = match marked {
            Ok(()) => lease.done(Ok(())).await,
            Err(err) => lease.done(Err(anyhow::Error::new(err))).await,
        };

        let mut stats = lock_stats(&self.stats);
        stats.current_running = stats.current_running.saturating_sub(1);
        stats.records_processed += 1;
        match closed {
            Ok(()) => match written {
                Some(RecordState::Completed) => stats.records_completed += 1,
                _ => stats.records_errored += 1,
            },
            Err(err) => {
                stats.finalize_errors += 1;
                drop(stats);
                error!(
                    worker = %config.name,
                    queue = self.store.name(),
                    record_id = %record.id,
                    error = %err,
                    "failed to finalize record"
                );
            }
        }
    }

    /// Run `config.concurrency` poll loops on the current tokio runtime.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle<WorkerStats> {
        let shutdown = Shutdown::new(&config.name);
        let worker = Arc::new(self);
        let joins = (0..config.concurrency.max(1))
            .map(|slot| {
                let worker = Arc::clone(&worker);
                let config = config.clone();
                let stop = shutdown.subscribe();
                tokio::spawn(async move { worker.poll_loop(config, slot, stop).await })
            })
            .collect();

        WorkerHandle::new(shutdown, joins, Arc::clone(&worker.stats))
    }

    async fn poll_loop(&self, config: WorkerConfig, slot: usize, mut stop: StopListener) {
        info!(worker = %config.name, queue = self.store.name(), slot, "worker started");

        while !stop.is_stopped() {
            if self.process_one(&config).await {
                continue;
            }
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }

        info!(worker = %config.name, queue = self.store.name(), slot, "worker stopped");
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use dbworker_core::{Index, IndexJob, InitialState, ManualClock, Value};

    use crate::backend::InMemoryDatabase;
    use crate::store::DbQueueStore;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn job(commit: &str) -> IndexJob {
        IndexJob {
            repository_id: 9,
            commit: commit.to_string(),
            docker_image: "sourcegraph/scip-java".to_string(),
            root: Some("service".to_string()),
        }
    }

    fn store() -> DbQueueStore<Index, InMemoryDatabase> {
        let clock = Arc::new(ManualClock::new(t(0)));
        DbQueueStore::with_clock(Arc::new(InMemoryDatabase::new()), clock).unwrap()
    }

    struct FailOn(&'static str);

    #[async_trait]
    impl Handler<IndexJob> for FailOn {
        async fn handle(&self, record: &Record<IndexJob>, _: &mut dyn JobLease) -> anyhow::Result<()> {
            if record.payload.commit == self.0 {
                anyhow::bail!("no build config for {}", record.payload.commit);
            }
            Ok(())
        }
    }

    /// Rewrites the root column, then errors the record itself.
    struct Relocate;

    #[async_trait]
    impl Handler<IndexJob> for Relocate {
        async fn handle(&self, _: &Record<IndexJob>, lease: &mut dyn JobLease) -> anyhow::Result<()> {
            lease
                .update(vec![("root".to_string(), Value::from("moved"))])
                .await?;
            lease
                .mark_errored(dbworker_core::Failure::new("relocated"))
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn process_one_marks_complete_or_errored() {
        let store = store();
        let ok = store.enqueue(&job("good"), InitialState::Queued).await.unwrap();
        let bad = store.enqueue(&job("bad"), InitialState::Queued).await.unwrap();
        let worker = Worker::new(store.clone(), FailOn("bad"));
        let config = WorkerConfig::default();

        assert!(worker.process_one(&config).await);
        assert!(worker.process_one(&config).await);
        assert!(!worker.process_one(&config).await);

        let ok = store.get_by_id(ok).await.unwrap().unwrap();
        assert_eq!(ok.state, RecordState::Completed);
        let bad = store.get_by_id(bad).await.unwrap().unwrap();
        assert_eq!(bad.state, RecordState::Errored);
        assert_eq!(bad.failure_summary.as_deref(), Some("no build config for bad"));

        let stats = worker.stats();
        assert_eq!(stats.records_processed, 2);
        assert_eq!(stats.records_completed, 1);
        assert_eq!(stats.records_errored, 1);
        assert_eq!(stats.current_running, 0);
    }

    #[tokio::test]
    async fn handler_writes_and_finalization_commit_together() {
        let store = store();
        let id = store.enqueue(&job("a"), InitialState::Queued).await.unwrap();
        let worker = Worker::new(store.clone(), Relocate);

        assert!(worker.process_one(&WorkerConfig::default()).await);

        let record = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Errored);
        assert_eq!(record.payload.root.as_deref(), Some("moved"));
        assert_eq!(record.failure_summary.as_deref(), Some("relocated"));
        let stats = worker.stats();
        assert_eq!(stats.records_processed, 1);
        assert_eq!(stats.records_completed, 0);
        assert_eq!(stats.records_errored, 1);
        assert_eq!(stats.finalize_errors, 0);
    }

    /// Errors the record and then re-marks it complete inside a savepoint
    /// that it rolls back, so the errored mark is the one that commits.
    struct ChangeOfHeart;

    #[async_trait]
    impl Handler<IndexJob> for ChangeOfHeart {
        async fn handle(&self, _: &Record<IndexJob>, lease: &mut dyn JobLease) -> anyhow::Result<()> {
            lease.mark_errored(Failure::new("unsupported indexer")).await?;
            let sp = lease.savepoint().await?;
            lease.mark_complete().await?;
            lease.rollback_to_savepoint(sp).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stats_follow_the_committed_mark_not_the_handler_result() {
        let store = store();
        let id = store.enqueue(&job("a"), InitialState::Queued).await.unwrap();
        let worker = Worker::new(store.clone(), ChangeOfHeart);

        assert!(worker.process_one(&WorkerConfig::default()).await);

        let record = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Errored);
        assert_eq!(record.failure_summary.as_deref(), Some("unsupported indexer"));
        let stats = worker.stats();
        assert_eq!(stats.records_completed, 0);
        assert_eq!(stats.records_errored, 1);
    }

    #[tokio::test]
    async fn dequeue_errors_are_counted() {
        let db = InMemoryDatabase::new();
        let store: DbQueueStore<Index, _> = DbQueueStore::new(Arc::new(db.clone())).unwrap();
        let worker = Worker::new(store, FailOn("never"));

        db.set_unavailable(true);
        assert!(!worker.process_one(&WorkerConfig::default()).await);
        assert_eq!(worker.stats().dequeue_errors, 1);
    }

    #[tokio::test]
    async fn spawned_worker_drains_queue_and_stops() {
        let store = store();
        for commit in ["a", "b", "c", "d"] {
            store.enqueue(&job(commit), InitialState::Queued).await.unwrap();
        }

        let handle = Worker::new(store.clone(), FailOn("c")).spawn(
            WorkerConfig::default()
                .with_name("index-worker")
                .with_concurrency(2)
                .with_poll_interval(Duration::from_millis(5)),
        );

        for _ in 0..200 {
            if store.queued_count(true).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = handle.shutdown().await;
        assert_eq!(stats.records_processed, 4);
        assert_eq!(stats.records_completed, 3);
        assert_eq!(stats.records_errored, 1);
    }
}
