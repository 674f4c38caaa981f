//! Periodic return of stalled leases to the queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use dbworker_core::{Clock, QueueResult, SystemClock};
use dbworker_observability::{Counter, MetricsRegistry};

use crate::backend::ResetOutcome;
use crate::store::QueueStore;

use super::shutdown::{Shutdown, WorkerHandle};

/// Resetter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetterConfig {
    /// Name for logging
    pub name: String,
    /// Time between sweeps
    pub interval: Duration,
    /// Records processing for longer than this are considered abandoned
    pub stall_threshold: Duration,
}

impl Default for ResetterConfig {
    fn default() -> Self {
        Self {
            name: "resetter".to_string(),
            interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(5),
        }
    }
}

impl ResetterConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }
}

/// Resetter runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetterStats {
    pub cycles: u64,
    pub records_reset: u64,
    pub records_errored: u64,
    pub reset_errors: u64,
}

#[derive(Debug)]
struct ResetterMetrics {
    reset: Arc<Counter>,
    errored: Arc<Counter>,
    errors: Arc<Counter>,
}

/// Returns records stuck in `processing` to the queue of store `S`.
#[derive(Debug)]
pub struct Resetter<S: QueueStore> {
    store: S,
    config: ResetterConfig,
    clock: Arc<dyn Clock>,
    metrics: ResetterMetrics,
    stats: Arc<Mutex<ResetterStats>>,
}

impl<S: QueueStore> Resetter<S> {
    pub fn new(store: S, config: ResetterConfig, registry: &MetricsRegistry) -> Self {
        let queue = store.name().to_string();
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            metrics: ResetterMetrics {
                reset: registry.counter(&format!("{queue}.records_reset_total")),
                errored: registry.counter(&format!("{queue}.records_errored_total")),
                errors: registry.counter(&format!("{queue}.reset_errors_total")),
            },
            stats: Arc::new(Mutex::new(ResetterStats::default())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> ResetterStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run one sweep, updating counters and stats.
    pub async fn run_once(&self) -> QueueResult<ResetOutcome> {
        let result = self
            .store
            .reset_stalled(self.clock.now(), self.config.stall_threshold)
            .await;

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.cycles += 1;
        match &result {
            Ok(outcome) => {
                let reset = outcome.requeued.len() as u64;
                let errored = outcome.errored.len() as u64;
                stats.records_reset += reset;
                stats.records_errored += errored;
                self.metrics.reset.add(reset);
                self.metrics.errored.add(errored);
                if outcome.is_empty() {
                    debug!(resetter = %self.config.name, queue = self.store.name(), "no stalled records");
                } else {
                    info!(
                        resetter = %self.config.name,
                        queue = self.store.name(),
                        reset,
                        errored,
                        "reset stalled records"
                    );
                }
            }
            Err(err) => {
                stats.reset_errors += 1;
                self.metrics.errors.inc();
                error!(
                    resetter = %self.config.name,
                    queue = self.store.name(),
                    error = %err,
                    "failed to reset stalled records"
                );
            }
        }
        drop(stats);
        result
    }

    /// Run sweeps every `interval` on the current tokio runtime until stopped.
    pub fn spawn(self) -> WorkerHandle<ResetterStats> {
        let shutdown = Shutdown::new(&self.config.name);
        let mut stop = shutdown.subscribe();
        let stats = Arc::clone(&self.stats);

        let join = tokio::spawn(async move {
            info!(
                resetter = %self.config.name,
                queue = self.store.name(),
                interval_ms = self.config.interval.as_millis() as u64,
                stall_threshold_ms = self.config.stall_threshold.as_millis() as u64,
                "resetter started"
            );

            while !stop.is_stopped() {
                // Failures are counted and logged inside; the next sweep retries.
                let _ = self.run_once().await;

                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }

            info!(resetter = %self.config.name, queue = self.store.name(), "resetter stopped");
        });

        WorkerHandle::new(shutdown, vec![join], stats)
    }
}
