//! Infrastructure layer for Stagewright.
//!
//! Implementations of the storage ports defined in `stagewright-core`:
//! SQLite checkpoints, a filesystem artifact store with a SQLite index,
//! SHA-256 content hashing, and the engine configuration loader.

pub mod artifact;
pub mod config;
pub mod crypto;
pub mod sqlite;
pub mod stores;
