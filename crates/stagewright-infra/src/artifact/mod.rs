//! Artifact storage.
//!
//! - `filesystem`: content-addressed objects on disk with a SQLite index

pub mod filesystem;

pub use filesystem::FsArtifactStore;
