//! Storage ports and their in-memory implementations.

pub mod artifact;
pub mod checkpoint;
pub mod memory;

pub use artifact::{ArtifactError, ArtifactStore};
pub use checkpoint::{CheckpointError, CheckpointStore, RunStatusUpdate};
pub use memory::{InMemoryArtifactStore, InMemoryCheckpointStore};
