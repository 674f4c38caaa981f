//! Skip-locked dequeue with bounded race retry.
//!
//! A dequeue first claims a row in a short autocommit statement (skipping
//! rows locked by live leases), then opens the lease transaction and locks the
//! claimed id. When a racer already holds that id the attempt is discarded and
//! retried after a backoff delay.

use std::time::Duration;

use tracing::{debug, warn};

use dbworker_core::{Clock, QueueError, QueueResult, StoredRow, TableSpec};

use crate::backend::{Database, DatabaseTransaction};

/// How hard a dequeue tries before reporting contention.
///
/// Lost races back off exponentially from `base_delay` up to `max_delay`,
/// spread by a deterministic jitter so racers do not retry in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct DequeuePolicy {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound applied before jitter
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for DequeuePolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(10), Duration::from_millis(250))
    }
}

impl DequeuePolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether a lost race on attempt `attempt` (1-indexed) may be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Sleep before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let doubled = 2_f64.powi((attempt - 1).min(30) as i32);
        let delay_ms =
            (self.base_delay.as_millis() as f64 * doubled).min(self.max_delay.as_millis() as f64);

        // Keyed on the attempt number so tests see stable delays.
        let spread = ((attempt as f64 * 17.0) % 100.0) / 100.0 - 0.5;
        let jitter = delay_ms * self.jitter * spread * 2.0;

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Claim the next eligible row of `table` and lock it in a new transaction.
///
/// Returns `None` when no row is eligible. The returned transaction holds the
/// row lock until it is committed, rolled back or dropped.
pub(crate) async fn claim_and_lock<D: Database>(
    db: &D,
    table: &TableSpec,
    clock: &dyn Clock,
    policy: &DequeuePolicy,
    queue: &str,
) -> QueueResult<Option<(StoredRow, D::Tx)>> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        let Some(id) = db.claim_next(table, clock.now()).await? else {
            return Ok(None);
        };

        let mut tx = db.begin().await?;
        let race = match tx.lock(table, id).await {
            Ok(Some(row)) => {
                debug!(queue, record_id = %id, attempt, "dequeued record");
                return Ok(Some((row, tx)));
            }
            Ok(None) => QueueError::DequeueRace(id),
            Err(err) => {
                let primary = QueueError::from(err);
                return Err(match tx.rollback().await {
                    Ok(()) => primary,
                    Err(rollback) => QueueError::aggregate(primary, rollback.into()),
                });
            }
        };
        tx.rollback().await?;

        if !policy.should_retry(attempt) {
            warn!(queue, attempts = attempt, "dequeue gave up under contention");
            return Err(QueueError::DequeueContention { attempts: attempt });
        }

        let delay = policy.backoff(attempt);
        debug!(queue, attempt, error = %race, delay_ms = delay.as_millis() as u64, "retrying dequeue");
        tokio::time::sleep(delay).await;
    }
}
