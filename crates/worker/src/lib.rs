//! Process wiring: one observed store and one resetter per record kind,
//! plus a task that keeps the `queue_size` gauges current.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use dbworker_core::{Index, RecordKind, StoreError, Upload};
use dbworker_infra::backend::{Database, PostgresDatabase};
use dbworker_infra::store::{DbQueueStore, ObservedStore, QueueStore};
use dbworker_infra::workers::{Resetter, ResetterStats, Shutdown, WorkerHandle};
use dbworker_infra::QueueConfig;
use dbworker_observability::MetricsRegistry;

pub type Store<K, D> = ObservedStore<DbQueueStore<K, D>>;

/// Create the queue tables if they are missing.
pub async fn prepare_postgres(db: &PostgresDatabase) -> Result<(), StoreError> {
    for table in [Upload::table(), Index::table()] {
        db.ensure_table(&table).await?;
    }
    Ok(())
}

/// Running queues of this process.
pub struct Services<D: Database> {
    pub uploads: Store<Upload, D>,
    pub indexes: Store<Index, D>,
    resetters: Vec<(&'static str, WorkerHandle<ResetterStats>)>,
    gauges: Shutdown,
    gauge_task: Option<JoinHandle<()>>,
    registry: Arc<MetricsRegistry>,
}

impl<D: Database> Services<D> {
    /// Build the stores and start their resetters and the gauge refresh on
    /// the current runtime. Gauges are refreshed every `reset_interval`.
    pub fn start(
        db: Arc<D>,
        config: &QueueConfig,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, StoreError> {
        let uploads = observed::<Upload, D>(&db, config, &registry)?;
        let indexes = observed::<Index, D>(&db, config, &registry)?;

        let resetters = vec![
            (
                Upload::NAME,
                Resetter::new(uploads.clone(), config.resetter_config(Upload::NAME), &registry)
                    .spawn(),
            ),
            (
                Index::NAME,
                Resetter::new(indexes.clone(), config.resetter_config(Index::NAME), &registry)
                    .spawn(),
            ),
        ];
        let gauges = Shutdown::new(&format!("{}-gauges", config.name));
        let gauge_task = spawn_gauge_refresh(
            uploads.clone(),
            indexes.clone(),
            config.reset_interval,
            &gauges,
        );
        info!(worker = %config.name, queues = resetters.len(), "queue services started");

        Ok(Self {
            uploads,
            indexes,
            resetters,
            gauges,
            gauge_task: Some(gauge_task),
            registry,
        })
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Refresh the `queue_size` gauges now.
    pub async fn refresh_gauges(&self) {
        refresh_gauges(&self.uploads, &self.indexes).await;
    }

    /// Stop every resetter and the gauge refresh, then wait for all of them.
    pub async fn shutdown(mut self) -> Vec<(&'static str, ResetterStats)> {
        self.gauges.stop();
        for (_, handle) in &self.resetters {
            handle.stop();
        }
        if let Some(task) = self.gauge_task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "gauge refresh ended abnormally");
            }
        }
        let mut stats = Vec::with_capacity(self.resetters.len());
        for (queue, mut handle) in self.resetters.drain(..) {
            handle.join().await;
            stats.push((queue, handle.stats()));
        }
        stats
    }
}

// Failures are recorded by the observed store itself.
async fn refresh_gauges<D: Database>(uploads: &Store<Upload, D>, indexes: &Store<Index, D>) {
    let _ = uploads.queue_size().await;
    let _ = indexes.queue_size().await;
}

fn spawn_gauge_refresh<D: Database>(
    uploads: Store<Upload, D>,
    indexes: Store<Index, D>,
    interval: Duration,
    shutdown: &Shutdown,
) -> JoinHandle<()> {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        while !stop.is_stopped() {
            refresh_gauges(&uploads, &indexes).await;
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

fn observed<K: RecordKind, D: Database>(
    db: &Arc<D>,
    config: &QueueConfig,
    registry: &Arc<MetricsRegistry>,
) -> Result<Store<K, D>, StoreError> {
    let store = DbQueueStore::<K, D>::new(Arc::clone(db))?.with_options(config.store_options());
    Ok(ObservedStore::new(store, Arc::clone(registry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbworker_core::{InitialState, UploadJob};
    use dbworker_infra::backend::InMemoryDatabase;

    fn upload(commit: &str) -> UploadJob {
        UploadJob {
            repository_id: 1,
            commit: commit.to_string(),
            root: "".to_string(),
            indexer: "scip-rust".to_string(),
            num_parts: 1,
            upload_size: None,
        }
    }

    #[tokio::test]
    async fn services_start_and_stop_every_resetter() {
        let db = Arc::new(InMemoryDatabase::new());
        let registry = Arc::new(MetricsRegistry::new());
        let services = Services::start(db, &QueueConfig::default(), Arc::clone(&registry)).unwrap();

        services
            .uploads
            .enqueue(&upload(&"a".repeat(40)), InitialState::Queued)
            .await
            .unwrap();
        services.refresh_gauges().await;

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.gauges["uploads.queue_size"], 1);
        assert_eq!(snapshot.gauges["indexes.queue_size"], 0);

        let stats = services.shutdown().await;
        let queues: Vec<_> = stats.iter().map(|(queue, _)| *queue).collect();
        assert_eq!(queues, vec!["uploads", "indexes"]);
        assert!(stats.iter().all(|(_, s)| s.reset_errors == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn gauges_follow_the_queue_between_refreshes() {
        let db = Arc::new(InMemoryDatabase::new());
        let registry = Arc::new(MetricsRegistry::new());
        let config = QueueConfig::default().with_reset_interval(Duration::from_secs(10));
        let services = Services::start(db, &config, Arc::clone(&registry)).unwrap();

        // Let the first refresh run against the empty queue.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.snapshot().gauges["uploads.queue_size"], 0);

        for commit in ["a", "b", "c"] {
            services
                .uploads
                .enqueue(&upload(commit), InitialState::Queued)
                .await
                .unwrap();
        }
        assert_eq!(registry.snapshot().gauges["uploads.queue_size"], 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(registry.snapshot().gauges["uploads.queue_size"], 3);

        services.shutdown().await;
    }
}
