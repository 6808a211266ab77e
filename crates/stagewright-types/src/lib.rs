//! Shared domain types for Stagewright.
//!
//! Pure data: no I/O, no async. Every other crate in the workspace builds on
//! these definitions.

pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gate;
pub mod run;
pub mod workflow;
