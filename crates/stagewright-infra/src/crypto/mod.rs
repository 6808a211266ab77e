//! Cryptographic operations for Stagewright.
//!
//! - `hash`: SHA-256 content hashing for artifact integrity

pub mod hash;
