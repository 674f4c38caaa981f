//! Relational storage behind the queue.
//!
//! [`Database`] is the narrow set of statements the queue issues; the
//! in-memory and Postgres implementations share its locking semantics.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryDatabase, InMemoryTransaction};
pub use postgres::{PostgresDatabase, PostgresTransaction, create_table_statements};
pub use r#trait::{Assignment, Database, DatabaseTransaction, ResetOutcome, ResetRequest};
