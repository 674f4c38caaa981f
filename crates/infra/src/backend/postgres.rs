//! Postgres-backed queue tables.
//!
//! SQL is generated from a validated [`TableSpec`]; identifiers are quoted
//! and every value is bound as a parameter.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (lock not available) | `55P03` | `LockNotAvailable` |
//! | Database (serialization / deadlock) | `40001` / `40P01` | `Unavailable` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | ColumnDecode / ColumnNotFound / Decode | N/A | `Decode` |
//! | Other | N/A | `Database` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::{FromRow, QueryBuilder, Row, Transaction};
use tracing::instrument;

use dbworker_core::{
    ColumnType, Failure, NaturalKey, QUEUE_COLUMNS, RecordId, RecordMeta, RecordState,
    StoreError, StoreResult, StoredRow, TableSpec, Value,
};

use super::r#trait::{Assignment, Database, DatabaseTransaction, ResetOutcome, ResetRequest};

/// Postgres [`Database`] over a connection pool.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and its queue indexes if they do not exist.
    #[instrument(skip(self, table), fields(table = table.name()), err)]
    pub async fn ensure_table(&self, table: &TableSpec) -> StoreResult<()> {
        table.validate()?;
        for statement in create_table_statements(table) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_table", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    type Tx = PostgresTransaction;

    async fn insert(
        &self,
        table: &TableSpec,
        state: RecordState,
        values: &[Value],
        now: DateTime<Utc>,
    ) -> StoreResult<RecordId> {
        table.check_values(values)?;
        let mut query = insert_query(table, state, values, now);
        let id: i64 = query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(RecordId::new(id))
    }

    async fn claim_next(
        &self,
        table: &TableSpec,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RecordId>> {
        let name = ident(table.name());
        let mut query = QueryBuilder::<Postgres>::new("WITH candidate AS (SELECT id FROM ");
        query
            .push(&name)
            .push(" WHERE state = 'queued' AND (process_after IS NULL OR process_after <= ")
            .push_bind(now)
            .push(") ORDER BY ")
            .push(order_clause(table))
            .push(" FOR UPDATE SKIP LOCKED LIMIT 1) UPDATE ")
            .push(&name)
            .push(" SET state = 'processing', started_at = ")
            .push_bind(now)
            .push(
                ", finished_at = NULL, failure_summary = NULL, failure_stacktrace = NULL \
                 WHERE id IN (SELECT id FROM candidate) RETURNING id",
            );

        let id: Option<i64> = query
            .build_query_scalar()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        Ok(id.map(RecordId::new))
    }

    async fn begin(&self) -> StoreResult<PostgresTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction { tx })
    }

    async fn fetch(&self, table: &TableSpec, id: RecordId) -> StoreResult<Option<StoredRow>> {
        let name = ident(table.name());
        let mut query = QueryBuilder::<Postgres>::new("SELECT ");
        query
            .push(select_list(table))
            .push(", r.rank FROM ")
            .push(&name)
            .push(" q LEFT JOIN (SELECT id, ROW_NUMBER() OVER (ORDER BY queued_at, id) AS rank FROM ")
            .push(&name)
            .push(" WHERE state = 'queued') r ON r.id = q.id WHERE q.id = ")
            .push_bind(id.get());

        let row = query
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?;
        row.map(|row| decode_row(table, &row)).transpose()
    }

    async fn count(&self, table: &TableSpec, states: &[RecordState]) -> StoreResult<u64> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ");
        query
            .push(ident(table.name()))
            .push(" WHERE state = ANY(")
            .push_bind(state_names(states))
            .push(")");

        let count: i64 = query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn exists(
        &self,
        table: &TableSpec,
        states: &[RecordState],
        key: &NaturalKey,
    ) -> StoreResult<bool> {
        let key_columns = table.natural_key_columns();
        let mut query = QueryBuilder::<Postgres>::new("SELECT EXISTS (SELECT 1 FROM ");
        query
            .push(ident(table.name()))
            .push(" WHERE state = ANY(")
            .push_bind(state_names(states))
            .push(")");
        for (column, value) in key_columns.iter().zip(&key.0) {
            query.push(" AND ").push(ident(column));
            if value.is_null() {
                query.push(" IS NULL");
            } else {
                query.push(" = ");
                push_value(&mut query, value, column_type(table, column));
            }
        }
        query.push(")");

        let exists: bool = query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(exists)
    }

    async fn states(
        &self,
        table: &TableSpec,
        ids: &[RecordId],
    ) -> StoreResult<Vec<(RecordId, RecordState)>> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT id, state FROM ");
        query
            .push(ident(table.name()))
            .push(" WHERE id = ANY(")
            .push_bind(ids.iter().map(RecordId::get).collect::<Vec<_>>())
            .push(")");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("states", e))?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("states", e))?;
                let state: String = row
                    .try_get("state")
                    .map_err(|e| map_sqlx_error("states", e))?;
                Ok((RecordId::new(id), state.parse()?))
            })
            .collect()
    }

    async fn requeue(
        &self,
        table: &TableSpec,
        id: RecordId,
        after: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let name = ident(table.name());
        let mut query = QueryBuilder::<Postgres>::new("WITH target AS (SELECT id FROM ");
        query
            .push(&name)
            .push(" WHERE id = ")
            .push_bind(id.get())
            .push(" FOR UPDATE NOWAIT) UPDATE ")
            .push(&name)
            .push(" SET state = 'queued', process_after = ")
            .push_bind(after)
            .push(
                ", started_at = NULL, finished_at = NULL, failure_summary = NULL, \
                 failure_stacktrace = NULL WHERE id IN (SELECT id FROM target) RETURNING id",
            );

        let updated: Option<i64> = query
            .build_query_scalar()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;
        Ok(updated.is_some())
    }

    async fn mark_queued(
        &self,
        table: &TableSpec,
        id: RecordId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let name = ident(table.name());
        let mut query = QueryBuilder::<Postgres>::new("WITH target AS (SELECT id FROM ");
        query
            .push(&name)
            .push(" WHERE id = ")
            .push_bind(id.get())
            .push(" AND state = 'uploading' FOR UPDATE NOWAIT) UPDATE ")
            .push(&name)
            .push(" SET state = 'queued', queued_at = ")
            .push_bind(now)
            .push(" WHERE id IN (SELECT id FROM target) RETURNING id");

        let updated: Option<i64> = query
            .build_query_scalar()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_queued", e))?;
        Ok(updated.is_some())
    }

    async fn reset_stalled(
        &self,
        table: &TableSpec,
        request: &ResetRequest,
    ) -> StoreResult<ResetOutcome> {
        let name = ident(table.name());
        let max_num_resets = i32::try_from(request.max_num_resets).unwrap_or(i32::MAX);

        let mut query = QueryBuilder::<Postgres>::new("WITH stalled AS (SELECT id, num_resets FROM ");
        query
            .push(&name)
            .push(" WHERE state = 'processing' AND started_at < ")
            .push_bind(request.cutoff)
            .push(" FOR UPDATE SKIP LOCKED), requeued AS (UPDATE ")
            .push(&name)
            .push(
                " q SET state = 'queued', started_at = NULL, num_resets = q.num_resets + 1 \
                 FROM stalled s WHERE q.id = s.id AND s.num_resets < ",
            )
            .push_bind(max_num_resets)
            .push(" RETURNING q.id), errored AS (UPDATE ")
            .push(&name)
            .push(" q SET state = 'errored', finished_at = ")
            .push_bind(request.now)
            .push(", failure_summary = ")
            .push_bind(request.failure_summary.clone())
            .push(
                ", failure_stacktrace = NULL FROM stalled s \
                 WHERE q.id = s.id AND s.num_resets >= ",
            )
            .push_bind(max_num_resets)
            .push(
                " RETURNING q.id) \
                 SELECT id, 'queued' AS outcome FROM requeued \
                 UNION ALL SELECT id, 'errored' AS outcome FROM errored",
            );

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_stalled", e))?;

        let mut outcome = ResetOutcome::default();
        for row in rows {
            let id: i64 = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("reset_stalled", e))?;
            let kind: String = row
                .try_get("outcome")
                .map_err(|e| map_sqlx_error("reset_stalled", e))?;
            match kind.as_str() {
                "errored" => outcome.errored.push(RecordId::new(id)),
                _ => outcome.requeued.push(RecordId::new(id)),
            }
        }
        Ok(outcome)
    }
}

/// Open Postgres transaction. Dropping it rolls back.
#[derive(Debug)]
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
    async fn lock(&mut self, table: &TableSpec, id: RecordId) -> StoreResult<Option<StoredRow>> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT ");
        query
            .push(select_list(table))
            .push(", NULL::BIGINT AS rank FROM ")
            .push(ident(table.name()))
            .push(" q WHERE q.id = ")
            .push_bind(id.get())
            .push(" FOR UPDATE SKIP LOCKED");

        let row = query
            .build()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock", e))?;
        row.map(|row| decode_row(table, &row)).transpose()
    }

    async fn insert(
        &mut self,
        table: &TableSpec,
        state: RecordState,
        values: &[Value],
        now: DateTime<Utc>,
    ) -> StoreResult<RecordId> {
        table.check_values(values)?;
        let mut query = insert_query(table, state, values, now);
        let id: i64 = query
            .build_query_scalar()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(RecordId::new(id))
    }

    async fn update(
        &mut self,
        table: &TableSpec,
        id: RecordId,
        assignments: &[Assignment],
    ) -> StoreResult<bool> {
        if assignments.is_empty() {
            return Ok(true);
        }

        let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
        query.push(ident(table.name())).push(" SET ");
        for (i, (column, value)) in assignments.iter().enumerate() {
            if i > 0 {
                query.push(", ");
            }
            query.push(ident(column)).push(" = ");
            push_value(&mut query, value, column_type(table, column));
        }
        query
            .push(" WHERE id = ")
            .push_bind(id.get())
            .push(" RETURNING id");

        let updated: Option<i64> = query
            .build_query_scalar()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        Ok(updated.is_some())
    }

    async fn finalize(
        &mut self,
        table: &TableSpec,
        id: RecordId,
        state: RecordState,
        failure: Option<&Failure>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
        query
            .push(ident(table.name()))
            .push(" SET state = ")
            .push_bind(state.as_str())
            .push(", finished_at = ")
            .push_bind(now)
            .push(", failure_summary = ")
            .push_bind(failure.map(|f| f.summary.clone()))
            .push(", failure_stacktrace = ")
            .push_bind(failure.and_then(|f| f.stacktrace.clone()))
            .push(" WHERE id = ")
            .push_bind(id.get())
            .push(" AND state IN ('processing', 'completed', 'errored') RETURNING id");

        let updated: Option<i64> = query
            .build_query_scalar()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("finalize", e))?;
        Ok(updated.is_some())
    }

    async fn savepoint(&mut self, name: &str) -> StoreResult<()> {
        sqlx::query(&format!("SAVEPOINT {}", ident(name)))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("savepoint", e))?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", ident(name)))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("rollback_to_savepoint", e))?;
        // ROLLBACK TO keeps the savepoint itself; release it to match the handle's stack.
        sqlx::query(&format!("RELEASE SAVEPOINT {}", ident(name)))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("release_savepoint", e))?;
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// DDL for a queue table and its dequeue/reset indexes.
pub fn create_table_statements(table: &TableSpec) -> Vec<String> {
    let name = ident(table.name());
    let states = RecordState::ALL
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");

    let mut columns = vec![
        "id BIGSERIAL PRIMARY KEY".to_string(),
        format!("state TEXT NOT NULL CHECK (state IN ({}))", states),
        "queued_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string(),
        "started_at TIMESTAMPTZ".to_string(),
        "finished_at TIMESTAMPTZ".to_string(),
        "failure_summary TEXT".to_string(),
        "failure_stacktrace TEXT".to_string(),
        "process_after TIMESTAMPTZ".to_string(),
        "num_resets INTEGER NOT NULL DEFAULT 0".to_string(),
    ];
    for column in table.columns() {
        columns.push(format!(
            "{} {}{}",
            ident(&column.name),
            column.ty.sql_type(),
            if column.nullable { "" } else { " NOT NULL" }
        ));
    }

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            name,
            columns.join(",\n    ")
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (queued_at, id) WHERE state = 'queued'",
            ident(&format!("{}_queued_idx", table.name())),
            name
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (started_at) WHERE state = 'processing'",
            ident(&format!("{}_processing_idx", table.name())),
            name
        ),
    ]
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn select_list(table: &TableSpec) -> String {
    QUEUE_COLUMNS
        .iter()
        .map(|c| format!("q.{}", c))
        .chain(table.columns().iter().map(|c| format!("q.{}", ident(&c.name))))
        .collect::<Vec<_>>()
        .join(", ")
}

fn order_clause(table: &TableSpec) -> String {
    let ordering = table.ordering();
    let mut terms: Vec<String> = ordering
        .iter()
        .map(|term| {
            format!(
                "{} {}",
                ident(&term.column),
                if term.descending { "DESC" } else { "ASC" }
            )
        })
        .collect();
    if !ordering.iter().any(|term| term.column == "id") {
        terms.push("id ASC".to_string());
    }
    terms.join(", ")
}

fn state_names(states: &[RecordState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

fn column_type(table: &TableSpec, column: &str) -> ColumnType {
    table
        .column_index(column)
        .map(|i| table.columns()[i].ty)
        .unwrap_or(ColumnType::Text)
}

fn push_value(query: &mut QueryBuilder<'_, Postgres>, value: &Value, ty: ColumnType) {
    match value {
        Value::Integer(v) => {
            query.push_bind(*v);
        }
        Value::Text(v) => {
            query.push_bind(v.clone());
        }
        Value::Timestamp(v) => {
            query.push_bind(*v);
        }
        Value::Null => match ty {
            ColumnType::Integer => {
                query.push_bind(None::<i64>);
            }
            ColumnType::Text => {
                query.push_bind(None::<String>);
            }
            ColumnType::Timestamp => {
                query.push_bind(None::<DateTime<Utc>>);
            }
        },
    }
}

fn insert_query<'a>(
    table: &TableSpec,
    state: RecordState,
    values: &[Value],
    now: DateTime<Utc>,
) -> QueryBuilder<'a, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(ident(table.name())).push(" (state, queued_at");
    for column in table.columns() {
        query.push(", ").push(ident(&column.name));
    }
    query
        .push(") VALUES (")
        .push_bind(state.as_str())
        .push(", ")
        .push_bind(now);
    for (column, value) in table.columns().iter().zip(values) {
        query.push(", ");
        push_value(&mut query, value, column.ty);
    }
    query.push(") RETURNING id");
    query
}

/// Queue-management columns of a row.
#[derive(Debug)]
struct QueueColumnsRow {
    id: i64,
    state: String,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    failure_summary: Option<String>,
    failure_stacktrace: Option<String>,
    process_after: Option<DateTime<Utc>>,
    num_resets: i32,
    rank: Option<i64>,
}

impl<'r> FromRow<'r, PgRow> for QueueColumnsRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueColumnsRow {
            id: row.try_get("id")?,
            state: row.try_get("state")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            failure_summary: row.try_get("failure_summary")?,
            failure_stacktrace: row.try_get("failure_stacktrace")?,
            process_after: row.try_get("process_after")?,
            num_resets: row.try_get("num_resets")?,
            rank: row.try_get("rank")?,
        })
    }
}

impl TryFrom<QueueColumnsRow> for RecordMeta {
    type Error = StoreError;

    fn try_from(row: QueueColumnsRow) -> Result<Self, Self::Error> {
        Ok(RecordMeta {
            id: RecordId::new(row.id),
            state: row.state.parse()?,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            failure_summary: row.failure_summary,
            failure_stacktrace: row.failure_stacktrace,
            process_after: row.process_after,
            num_resets: u32::try_from(row.num_resets).unwrap_or(0),
        })
    }
}

fn decode_row(table: &TableSpec, row: &PgRow) -> StoreResult<StoredRow> {
    let queue = QueueColumnsRow::from_row(row).map_err(|e| map_sqlx_error("decode_row", e))?;
    let rank = queue.rank.and_then(|r| u64::try_from(r).ok());
    let meta = RecordMeta::try_from(queue)?;

    let mut values = Vec::with_capacity(table.columns().len());
    for column in table.columns() {
        let name = column.name.as_str();
        let value: Value = match column.ty {
            ColumnType::Integer => row.try_get::<Option<i64>, _>(name).map(Value::from),
            ColumnType::Text => row.try_get::<Option<String>, _>(name).map(Value::from),
            ColumnType::Timestamp => row
                .try_get::<Option<DateTime<Utc>>, _>(name)
                .map(Value::from),
        }
        .map_err(|e| map_sqlx_error("decode_row", e))?;
        values.push(value);
    }

    Ok(StoredRow { meta, values, rank })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") => StoreError::LockNotAvailable(msg),
                Some("40001") | Some("40P01") => StoreError::Unavailable(msg),
                _ => StoreError::database(operation, db_err.message()),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::unavailable(format!("i/o error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => {
            StoreError::unavailable(format!("tls error in {}: {}", operation, e))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => StoreError::decode(format!("{}: {}", operation, err)),
        _ => StoreError::database(operation, err.to_string()),
    }
}
