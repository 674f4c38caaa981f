//! Queue stores.
//!
//! - `QueueStore`: the per-kind queue contract (enqueue, dequeue, lookups, resets)
//! - `DbQueueStore`: implementation over any relational [`Database`](crate::backend::Database)
//! - `JobHandle` / `EnqueueHandle`: transaction handles with savepoints
//! - `ObservedStore`: metrics and tracing decorator

pub mod db;
pub mod dequeue;
pub mod handle;
pub mod observed;
pub mod r#trait;

pub use db::{DbQueueStore, RESET_FAILURE_SUMMARY, StoreOptions};
pub use dequeue::DequeuePolicy;
pub use handle::{EnqueueHandle, JobHandle, TxHandle};
pub use observed::{ObservedLease, ObservedStore, ObservedTransaction};
pub use r#trait::{JobLease, PayloadOf, QueueStore, QueueTransaction};
