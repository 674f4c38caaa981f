//! Queue records and their lifecycle states.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::id::RecordId;
use crate::table::{RecordKind, Value};

/// Lifecycle state of a queue record.
///
/// `Uploading` records are invisible to dequeue until promoted with
/// `mark_queued`. `Completed` and `Errored` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Uploading,
    Queued,
    Processing,
    Completed,
    Errored,
}

impl RecordState {
    pub const ALL: [RecordState; 5] = [
        RecordState::Uploading,
        RecordState::Queued,
        RecordState::Processing,
        RecordState::Completed,
        RecordState::Errored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Uploading => "uploading",
            RecordState::Queued => "queued",
            RecordState::Processing => "processing",
            RecordState::Completed => "completed",
            RecordState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Completed | RecordState::Errored)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StoreError::decode(format!("unknown record state '{}'", s)))
    }
}

/// Initial state for a newly inserted record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialState {
    #[default]
    Queued,
    Uploading,
}

impl From<InitialState> for RecordState {
    fn from(value: InitialState) -> Self {
        match value {
            InitialState::Queued => RecordState::Queued,
            InitialState::Uploading => RecordState::Uploading,
        }
    }
}

/// Queue-management columns shared by every record kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub id: RecordId,
    pub state: RecordState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_summary: Option<String>,
    pub failure_stacktrace: Option<String>,
    pub process_after: Option<DateTime<Utc>>,
    pub num_resets: u32,
}

impl RecordMeta {
    /// Metadata for a row inserted at `now`.
    pub fn inserted(id: RecordId, state: RecordState, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state,
            queued_at: now,
            started_at: None,
            finished_at: None,
            failure_summary: None,
            failure_stacktrace: None,
            process_after: None,
            num_resets: 0,
        }
    }

    /// Whether dequeue may pick this record at `now`.
    pub fn is_dequeueable(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Queued && self.process_after.is_none_or(|after| after <= now)
    }

    /// Transition `queued -> processing`.
    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.state = RecordState::Processing;
        self.started_at = Some(now);
        self.finished_at = None;
        self.failure_summary = None;
        self.failure_stacktrace = None;
    }

    /// Terminal transition written by a job handle.
    pub fn finalize(&mut self, state: RecordState, failure: Option<&Failure>, now: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(now);
        self.failure_summary = failure.map(|f| f.summary.clone());
        self.failure_stacktrace = failure.and_then(|f| f.stacktrace.clone());
    }

    /// Return the record to the queue, optionally delaying it.
    pub fn requeue(&mut self, after: Option<DateTime<Utc>>) {
        self.state = RecordState::Queued;
        self.process_after = after;
        self.started_at = None;
        self.finished_at = None;
        self.failure_summary = None;
        self.failure_stacktrace = None;
    }

    /// Column value by name, for sorting on queue columns.
    pub fn column(&self, name: &str) -> Option<Value> {
        let value = match name {
            "id" => Value::Integer(self.id.get()),
            "state" => Value::Text(self.state.as_str().to_string()),
            "queued_at" => Value::Timestamp(self.queued_at),
            "started_at" => self.started_at.into(),
            "finished_at" => self.finished_at.into(),
            "failure_summary" => self.failure_summary.clone().into(),
            "failure_stacktrace" => self.failure_stacktrace.clone().into(),
            "process_after" => self.process_after.into(),
            "num_resets" => Value::Integer(i64::from(self.num_resets)),
            _ => return None,
        };
        Some(value)
    }

    /// Check the state/column invariants every stored row must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        let has_failure = self.failure_summary.is_some() || self.failure_stacktrace.is_some();
        if has_failure && self.state != RecordState::Errored {
            return Err(format!(
                "record {} carries failure details in state {}",
                self.id, self.state
            ));
        }
        if self.state.is_terminal() && self.finished_at.is_none() {
            return Err(format!("record {} is {} without finished_at", self.id, self.state));
        }
        if self.state == RecordState::Processing && self.started_at.is_none() {
            return Err(format!("record {} is processing without started_at", self.id));
        }
        Ok(())
    }
}

/// Failure details written when a record is marked errored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub summary: String,
    pub stacktrace: Option<String>,
}

impl Failure {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            stacktrace: None,
        }
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }
}

impl From<&anyhow::Error> for Failure {
    fn from(err: &anyhow::Error) -> Self {
        Self {
            summary: format!("{:#}", err),
            stacktrace: Some(format!("{:?}", err)),
        }
    }
}

/// Row as returned by a storage backend, before domain decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub meta: RecordMeta,
    /// Domain column values, in table declaration order.
    pub values: Vec<Value>,
    /// 1-based position among queued records; `None` unless queued.
    pub rank: Option<u64>,
}

/// A decoded queue record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<P> {
    pub id: RecordId,
    pub state: RecordState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_summary: Option<String>,
    pub failure_stacktrace: Option<String>,
    pub process_after: Option<DateTime<Utc>>,
    pub num_resets: u32,
    pub rank: Option<u64>,
    pub payload: P,
}

impl<P> Record<P> {
    /// Decode a backend row for record kind `K`.
    pub fn decode<K>(row: StoredRow) -> Result<Self, StoreError>
    where
        K: RecordKind<Payload = P>,
    {
        let payload = K::decode(&row.values)?;
        let meta = row.meta;
        Ok(Self {
            id: meta.id,
            state: meta.state,
            queued_at: meta.queued_at,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
            failure_summary: meta.failure_summary,
            failure_stacktrace: meta.failure_stacktrace,
            process_after: meta.process_after,
            num_resets: meta.num_resets,
            rank: row.rank,
            payload,
        })
    }
}
