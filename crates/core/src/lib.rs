//! `dbworker-core` — queue model shared by every store backend.
//!
//! This crate is **pure**: record states, table descriptions, savepoint
//! bookkeeping and the error model. Database access lives in `dbworker-infra`.

pub mod clock;
pub mod error;
pub mod id;
pub mod kinds;
pub mod record;
pub mod savepoint;
pub mod table;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorList, QueueError, QueueResult, StoreError, StoreResult};
pub use id::{RecordId, SavepointId};
pub use kinds::{Index, IndexJob, IndexKey, Upload, UploadJob, UploadKey};
pub use record::{Failure, InitialState, Record, RecordMeta, RecordState, StoredRow};
pub use savepoint::{Rollback, SavepointStack};
pub use table::{
    Column, ColumnType, NaturalKey, OrderBy, QUEUE_COLUMNS, RecordKind, TableSpec, Value,
    ValueReader,
};
