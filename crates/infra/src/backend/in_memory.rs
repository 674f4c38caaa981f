//! In-memory relational backend.
//!
//! Emulates the parts of Postgres the queue relies on: row locks held by open
//! transactions, `SKIP LOCKED` / `NOWAIT` semantics, savepoints and atomic
//! commit. Intended for tests/dev and single-process deployments.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dbworker_core::{
    Failure, NaturalKey, OrderBy, RecordId, RecordMeta, RecordState, StoreError, StoreResult,
    StoredRow, TableSpec, Value,
};

use super::r#trait::{Assignment, Database, DatabaseTransaction, ResetOutcome, ResetRequest};

type TxId = u64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RowRef {
    table: String,
    id: RecordId,
}

impl RowRef {
    fn new(table: &TableSpec, id: RecordId) -> Self {
        Self {
            table: table.name().to_string(),
            id,
        }
    }
}

#[derive(Debug, Clone)]
struct MemRow {
    meta: RecordMeta,
    values: Vec<Value>,
}

impl MemRow {
    fn column(&self, table: &TableSpec, name: &str) -> Value {
        self.meta
            .column(name)
            .or_else(|| {
                table
                    .column_index(name)
                    .and_then(|i| self.values.get(i).cloned())
            })
            .unwrap_or(Value::Null)
    }

    fn stored(self, rank: Option<u64>) -> StoredRow {
        StoredRow {
            meta: self.meta,
            values: self.values,
            rank,
        }
    }
}

#[derive(Debug, Default)]
struct MemTable {
    rows: BTreeMap<RecordId, MemRow>,
    last_id: i64,
}

impl MemTable {
    fn next_id(&mut self) -> RecordId {
        self.last_id += 1;
        RecordId::new(self.last_id)
    }

    fn rank(&self, id: RecordId) -> Option<u64> {
        let row = self.rows.get(&id)?;
        if row.meta.state != RecordState::Queued {
            return None;
        }
        let position = (row.meta.queued_at, row.meta.id);
        let ahead = self
            .rows
            .values()
            .filter(|other| other.meta.state == RecordState::Queued)
            .filter(|other| (other.meta.queued_at, other.meta.id) < position)
            .count();
        Some(ahead as u64 + 1)
    }
}

#[derive(Debug, Default)]
struct EngineState {
    tables: HashMap<String, MemTable>,
    locks: HashMap<RowRef, TxId>,
}

impl EngineState {
    fn table(&mut self, table: &TableSpec) -> &mut MemTable {
        self.tables.entry(table.name().to_string()).or_default()
    }

    fn committed(&self, key: &RowRef) -> Option<&MemRow> {
        self.tables.get(&key.table)?.rows.get(&key.id)
    }

    fn is_locked(&self, key: &RowRef) -> bool {
        self.locks.contains_key(key)
    }

    /// Take the row lock for `tx`, failing if another transaction holds it.
    fn acquire(&mut self, key: &RowRef, tx: TxId) -> StoreResult<()> {
        match self.locks.get(key) {
            Some(owner) if *owner != tx => Err(lock_not_available(key)),
            Some(_) => Ok(()),
            None => {
                self.locks.insert(key.clone(), tx);
                Ok(())
            }
        }
    }

    fn release(&mut self, tx: TxId) {
        self.locks.retain(|_, owner| *owner != tx);
    }

    /// Autocommit write on a committed row. Fails rather than waiting when a
    /// transaction holds the row.
    fn write_unlocked(&mut self, key: &RowRef) -> StoreResult<Option<&mut MemRow>> {
        if self.is_locked(key) {
            return Err(lock_not_available(key));
        }
        Ok(self
            .tables
            .get_mut(&key.table)
            .and_then(|t| t.rows.get_mut(&key.id)))
    }
}

fn lock_not_available(key: &RowRef) -> StoreError {
    StoreError::lock_not_available(format!("{} row {} is locked", key.table, key.id))
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<EngineState>,
    next_tx: AtomicU64,
    unavailable: AtomicBool,
}

impl Shared {
    fn lock(&self) -> StoreResult<MutexGuard<'_, EngineState>> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::unavailable("in-memory database is offline"));
        }
        Ok(self.lock_unchecked())
    }

    fn lock_unchecked(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory [`Database`].
///
/// Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    shared: Arc<Shared>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    ///
    /// Open transactions still release their locks when dropped.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared
            .unavailable
            .store(unavailable, AtomicOrdering::SeqCst);
    }

    /// Committed queue columns of every row in `table`, by id.
    pub fn rows(&self, table: &str) -> Vec<RecordMeta> {
        self.shared
            .lock_unchecked()
            .tables
            .get(table)
            .map(|t| t.rows.values().map(|row| row.meta.clone()).collect())
            .unwrap_or_default()
    }
}

fn compare_rows(table: &TableSpec, ordering: &[OrderBy], a: &MemRow, b: &MemRow) -> Ordering {
    for term in ordering {
        let cmp = a
            .column(table, &term.column)
            .sort_cmp(&b.column(table, &term.column));
        let cmp = if term.descending { cmp.reverse() } else { cmp };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    a.meta.id.cmp(&b.meta.id)
}

#[async_trait]
impl Database for InMemoryDatabase {
    type Tx = InMemoryTransaction;

    async fn insert(
        &self,
        table: &TableSpec,
        state: RecordState,
        values: &[Value],
        now: DateTime<Utc>,
    ) -> StoreResult<RecordId> {
        table.check_values(values)?;
        let mut engine = self.shared.lock()?;
        let mem = engine.table(table);
        let id = mem.next_id();
        mem.rows.insert(
            id,
            MemRow {
                meta: RecordMeta::inserted(id, state, now),
                values: values.to_vec(),
            },
        );
        Ok(id)
    }

    async fn claim_next(
        &self,
        table: &TableSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RecordId>> {
        let ordering = table.ordering();
        let mut engine = self.shared.lock()?;
        let EngineState { tables, locks } = &mut *engine;
        let mem = tables.entry(table.name().to_string()).or_default();

        let candidate = mem
            .rows
            .values()
            .filter(|row| row.meta.is_dequeueable(now))
            .filter(|row| !locks.contains_key(&RowRef::new(table, row.meta.id)))
            .min_by(|a, b| compare_rows(table, &ordering, a, b))
            .map(|row| row.meta.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        if let Some(row) = mem.rows.get_mut(&id) {
            row.meta.claim(now);
        }
        Ok(Some(id))
    }

    async fn begin(&self) -> StoreResult<InMemoryTransaction> {
        // Check availability up front, like a failed pool checkout.
        drop(self.shared.lock()?);
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_tx.fetch_add(1, AtomicOrdering::SeqCst) + 1,
            writes: BTreeMap::new(),
            savepoints: Vec::new(),
            open: true,
        })
    }

    async fn fetch(&self, table: &TableSpec, id: RecordId) -> StoreResult<Option<StoredRow>> {
        let engine = self.shared.lock()?;
        let Some(mem) = engine.tables.get(table.name()) else {
            return Ok(None);
        };
        Ok(mem
            .rows
            .get(&id)
            .cloned()
            .map(|row| row.stored(mem.rank(id))))
    }

    async fn count(&self, table: &TableSpec, states: &[RecordState]) -> StoreResult<u64> {
        let engine = self.shared.lock()?;
        Ok(engine
            .tables
            .get(table.name())
            .map(|mem| {
                mem.rows
                    .values()
                    .filter(|row| states.contains(&row.meta.state))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn exists(
        &self,
        table: &TableSpec,
        states: &[RecordState],
        key: &NaturalKey,
    ) -> StoreResult<bool> {
        let engine = self.shared.lock()?;
        Ok(engine.tables.get(table.name()).is_some_and(|mem| {
            mem.rows
                .values()
                .filter(|row| states.contains(&row.meta.state))
                .any(|row| table.key_of(&row.values) == *key)
        }))
    }

    async fn states(
        &self,
        table: &TableSpec,
        ids: &[RecordId],
    ) -> StoreResult<Vec<(RecordId, RecordState)>> {
        let engine = self.shared.lock()?;
        let Some(mem) = engine.tables.get(table.name()) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| mem.rows.get(id).map(|row| (*id, row.meta.state)))
            .collect())
    }

    async fn requeue(
        &self,
        table: &TableSpec,
        id: RecordId,
        after: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut engine = self.shared.lock()?;
        match engine.write_unlocked(&RowRef::new(table, id))? {
            Some(row) => {
                row.meta.requeue(Some(after));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_queued(
        &self,
        table: &TableSpec,
        id: RecordId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut engine = self.shared.lock()?;
        match engine.write_unlocked(&RowRef::new(table, id))? {
            Some(row) if row.meta.state == RecordState::Uploading => {
                row.meta.state = RecordState::Queued;
                row.meta.queued_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stalled(
        &self,
        table: &TableSpec,
        request: &ResetRequest,
    ) -> StoreResult<ResetOutcome> {
        let mut engine = self.shared.lock()?;
        let EngineState { tables, locks } = &mut *engine;
        let Some(mem) = tables.get_mut(table.name()) else {
            return Ok(ResetOutcome::default());
        };

        let failure = Failure::new(request.failure_summary.clone());
        let mut outcome = ResetOutcome::default();
        for row in mem.rows.values_mut() {
            let stalled = row.meta.state == RecordState::Processing
                && row.meta.started_at.is_some_and(|t| t < request.cutoff);
            if !stalled || locks.contains_key(&RowRef::new(table, row.meta.id)) {
                continue;
            }

            if row.meta.num_resets >= request.max_num_resets {
                row.meta
                    .finalize(RecordState::Errored, Some(&failure), request.now);
                outcome.errored.push(row.meta.id);
            } else {
                row.meta.state = RecordState::Queued;
                row.meta.started_at = None;
                row.meta.num_resets += 1;
                outcome.requeued.push(row.meta.id);
            }
        }
        Ok(outcome)
    }
}

/// Transaction on an [`InMemoryDatabase`].
///
/// Writes are buffered until commit; row locks are recorded in the shared
/// lock table as soon as they are taken.
#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    id: TxId,
    writes: BTreeMap<RowRef, MemRow>,
    savepoints: Vec<(String, BTreeMap<RowRef, MemRow>)>,
    open: bool,
}

impl InMemoryTransaction {
    fn current(&self, engine: &EngineState, key: &RowRef) -> Option<MemRow> {
        self.writes
            .get(key)
            .or_else(|| engine.committed(key))
            .cloned()
    }

    /// Lock `key` for writing and return its current version.
    fn row_for_write(&self, key: &RowRef) -> StoreResult<Option<MemRow>> {
        let shared = Arc::clone(&self.shared);
        let mut engine = shared.lock()?;
        let Some(row) = self.current(&engine, key) else {
            return Ok(None);
        };
        engine.acquire(key, self.id)?;
        Ok(Some(row))
    }
}

#[async_trait]
impl DatabaseTransaction for InMemoryTransaction {
    async fn lock(&mut self, table: &TableSpec, id: RecordId) -> StoreResult<Option<StoredRow>> {
        let key = RowRef::new(table, id);
        let shared = Arc::clone(&self.shared);
        let mut engine = shared.lock()?;

        if engine.locks.get(&key).is_some_and(|owner| *owner != self.id) {
            return Ok(None);
        }
        let Some(row) = self.current(&engine, &key) else {
            return Ok(None);
        };
        engine.acquire(&key, self.id)?;

        let rank = engine.tables.get(&key.table).and_then(|mem| mem.rank(id));
        Ok(Some(row.stored(rank)))
    }

    async fn insert(
        &mut self,
        table: &TableSpec,
        state: RecordState,
        values: &[Value],
        now: DateTime<Utc>,
    ) -> StoreResult<RecordId> {
        table.check_values(values)?;
        let shared = Arc::clone(&self.shared);
        let mut engine = shared.lock()?;
        // Ids come from a non-transactional sequence, so a rollback leaves a gap.
        let id = engine.table(table).next_id();
        let key = RowRef::new(table, id);
        engine.acquire(&key, self.id)?;
        self.writes.insert(
            key,
            MemRow {
                meta: RecordMeta::inserted(id, state, now),
                values: values.to_vec(),
            },
        );
        Ok(id)
    }

    async fn update(
        &mut self,
        table: &TableSpec,
        id: RecordId,
        assignments: &[Assignment],
    ) -> StoreResult<bool> {
        let key = RowRef::new(table, id);
        let Some(mut row) = self.row_for_write(&key)? else {
            return Ok(false);
        };
        for (column, value) in assignments {
            let index = table.column_index(column).ok_or_else(|| {
                StoreError::database("update", format!("column \"{}\" does not exist", column))
            })?;
            row.values[index] = value.clone();
        }
        self.writes.insert(key, row);
        Ok(true)
    }

    async fn finalize(
        &mut self,
        table: &TableSpec,
        id: RecordId,
        state: RecordState,
        failure: Option<&Failure>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let key = RowRef::new(table, id);
        let Some(mut row) = self.row_for_write(&key)? else {
            return Ok(false);
        };
        if !matches!(
            row.meta.state,
            RecordState::Processing | RecordState::Completed | RecordState::Errored
        ) {
            return Ok(false);
        }
        row.meta.finalize(state, failure, now);
        self.writes.insert(key, row);
        Ok(true)
    }

    async fn savepoint(&mut self, name: &str) -> StoreResult<()> {
        drop(self.shared.lock()?);
        self.savepoints.push((name.to_string(), self.writes.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()> {
        drop(self.shared.lock()?);
        let position = self
            .savepoints
            .iter()
            .rposition(|(existing, _)| existing == name)
            .ok_or_else(|| {
                StoreError::database(
                    "rollback_to_savepoint",
                    format!("savepoint \"{}\" does not exist", name),
                )
            })?;
        let mut released = self.savepoints.split_off(position);
        let (_, snapshot) = released.swap_remove(0);
        self.writes = snapshot;
        Ok(())
    }

    async fn commit(mut self) -> StoreResult<()> {
        let shared = Arc::clone(&self.shared);
        let mut engine = shared.lock()?;
        for (key, row) in std::mem::take(&mut self.writes) {
            engine
                .tables
                .entry(key.table)
                .or_default()
                .rows
                .insert(key.id, row);
        }
        engine.release(self.id);
        self.open = false;
        Ok(())
    }

    async fn rollback(mut self) -> StoreResult<()> {
        let shared = Arc::clone(&self.shared);
        let mut engine = shared.lock()?;
        engine.release(self.id);
        self.open = false;
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.open {
            self.shared.lock_unchecked().release(self.id);
        }
    }
}
