//! Background loops over queue stores.
//!
//! - `Worker`: polls a store and runs a `Handler` per dequeued record
//! - `Resetter`: periodically returns stalled leases to the queue
//! - `Shutdown` / `WorkerHandle`: close-once stop signal and join handle

pub mod queue_worker;
pub mod resetter;
pub mod shutdown;

pub use queue_worker::{Handler, Worker, WorkerConfig, WorkerStats};
pub use resetter::{Resetter, ResetterConfig, ResetterStats};
pub use shutdown::{Shutdown, StopListener, WorkerHandle};
