//! Infrastructure layer: relational queue storage, dequeue protocol, job
//! handles, background workers and configuration.

pub mod backend;
pub mod config;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, QueueConfig};
pub use store::{
    DbQueueStore, DequeuePolicy, JobHandle, JobLease, ObservedStore, QueueStore,
    QueueTransaction, StoreOptions,
};
pub use workers::{Handler, Resetter, ResetterConfig, Worker, WorkerConfig, WorkerHandle};
