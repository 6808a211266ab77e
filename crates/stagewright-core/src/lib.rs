//! Stagewright core: workflow scheduling, reference resolution, connector
//! dispatch, batch fan-out/fan-in, quality gates, and the storage ports the
//! infrastructure crate implements.

pub mod connector;
pub mod hash;
pub mod store;
pub mod workflow;
