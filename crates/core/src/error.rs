//! Queue error model.

use std::fmt;

use thiserror::Error;

use crate::id::{RecordId, SavepointId};

/// Result type used by the storage layer.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type used by queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failure reported by a storage backend.
///
/// Backends map their native errors into these variants so callers can tell
/// transient conditions (connectivity, lock contention) from programming or
/// data errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database could not be reached (pool closed, I/O, timeout).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row lock was requested with `NOWAIT` and is held by another transaction.
    #[error("lock not available: {0}")]
    LockNotAvailable(String),

    /// A row could not be decoded into the expected shape.
    #[error("failed to decode row: {0}")]
    Decode(String),

    /// A table description failed validation.
    #[error("invalid table spec: {0}")]
    InvalidSpec(String),

    /// Any other database failure, tagged with the operation that issued it.
    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn lock_not_available(msg: impl Into<String>) -> Self {
        Self::LockNotAvailable(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::LockNotAvailable(_))
    }
}

/// Error surfaced by queue stores and job handles.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The claimed record was locked by someone else before this dequeuer
    /// could lock it inside its own transaction.
    #[error("record {0} was taken by a concurrent dequeue")]
    DequeueRace(RecordId),

    /// Every dequeue attempt lost the race.
    #[error("dequeue gave up after {attempts} contended attempts")]
    DequeueContention { attempts: u32 },

    /// `done` was called on a job handle that was never marked complete or errored.
    #[error("job handle closed without marking the record complete or errored")]
    JobNotFinalized,

    /// A rollback was requested but no savepoint is active.
    #[error("no active savepoint")]
    NoSavepoint,

    /// A rollback named a savepoint that is not on the active stack.
    #[error("savepoint {0} is not active")]
    UnknownSavepoint(SavepointId),

    /// The handle's transaction has already been committed or rolled back.
    #[error("handle has no open transaction")]
    NoTransaction,

    /// The leased record is no longer in a state this handle may finalize.
    #[error("record {0} is no longer leased")]
    LeaseLost(RecordId),

    /// An update referenced a column the table does not declare, or a value
    /// of the wrong type.
    #[error("invalid column assignment: {0}")]
    InvalidAssignment(String),

    /// A natural key did not match the table's key columns.
    #[error("invalid natural key: {0}")]
    InvalidKey(String),

    /// The caller's own failure, handed back unchanged after rollback.
    #[error("{0:#}")]
    Job(anyhow::Error),

    /// Several failures that happened while closing one transaction.
    #[error("{0}")]
    Aggregate(ErrorList),
}

impl QueueError {
    /// Combine two failures, flattening nested aggregates.
    pub fn aggregate(first: QueueError, second: QueueError) -> Self {
        let mut list = ErrorList::default();
        list.push(first);
        list.push(second);
        Self::Aggregate(list)
    }

    /// Whether this error is the caller's own failure passed through unchanged.
    ///
    /// Decorators use this to avoid counting business failures as store errors.
    pub fn is_passthrough(&self) -> bool {
        match self {
            Self::Job(_) => true,
            Self::Aggregate(list) => list.iter().all(QueueError::is_passthrough),
            _ => false,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::DequeueRace(_) | Self::DequeueContention { .. } => true,
            _ => false,
        }
    }

    /// Misuse of the handle protocol by the caller.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::JobNotFinalized
                | Self::NoSavepoint
                | Self::UnknownSavepoint(_)
                | Self::NoTransaction
                | Self::InvalidAssignment(_)
                | Self::InvalidKey(_)
        )
    }
}

/// Ordered list of errors reported together.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<QueueError>);

impl ErrorList {
    pub fn push(&mut self, err: QueueError) {
        match err {
            QueueError::Aggregate(inner) => self.0.extend(inner.0),
            other => self.0.push(other),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collapse into a single error, or `None` when empty.
    pub fn into_error(mut self) -> Option<QueueError> {
        match self.0.len() {
            0 => None,
            1 => self.0.pop(),
            _ => Some(QueueError::Aggregate(self)),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl IntoIterator for ErrorList {
    type Item = QueueError;
    type IntoIter = std::vec::IntoIter<QueueError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_flattens_nested_lists() {
        let inner = QueueError::aggregate(
            QueueError::Job(anyhow::anyhow!("boom")),
            QueueError::JobNotFinalized,
        );
        let outer = QueueError::aggregate(inner, QueueError::NoTransaction);

        let QueueError::Aggregate(list) = outer else {
            panic!("expected aggregate");
        };
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn aggregate_display_lists_every_error() {
        let err = QueueError::aggregate(
            QueueError::Job(anyhow::anyhow!("boom")),
            StoreError::unavailable("connection reset").into(),
        );
        let text = err.to_string();
        assert!(text.starts_with("2 errors occurred:"));
        assert!(text.contains("boom"));
        assert!(text.contains("connection reset"));
    }

    #[test]
    fn passthrough_only_for_caller_errors() {
        assert!(QueueError::Job(anyhow::anyhow!("x")).is_passthrough());
        assert!(!QueueError::JobNotFinalized.is_passthrough());
        assert!(
            !QueueError::aggregate(
                QueueError::Job(anyhow::anyhow!("x")),
                StoreError::unavailable("down").into()
            )
            .is_passthrough()
        );
    }

    #[test]
    fn into_error_collapses_single_entries() {
        let mut list = ErrorList::default();
        assert!(list.is_empty());
        list.push(QueueError::NoSavepoint);
        assert!(matches!(list.into_error(), Some(QueueError::NoSavepoint)));
    }

    #[test]
    fn transient_classification() {
        assert!(QueueError::from(StoreError::unavailable("x")).is_transient());
        assert!(!QueueError::from(StoreError::decode("x")).is_transient());
        assert!(QueueError::DequeueContention { attempts: 3 }.is_transient());
        assert!(QueueError::NoTransaction.is_protocol_violation());
    }
}
