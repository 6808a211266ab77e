//! SQLite storage layer.
//!
//! The checkpoint store and the artifact index, backed by SQLite with WAL mode
//! and split read/write connection pools.

pub mod checkpoint;
pub mod pool;

pub use checkpoint::SqliteCheckpointStore;
pub use pool::{DatabaseError, DatabasePool};
