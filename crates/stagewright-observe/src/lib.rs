//! Observability for Stagewright: subscriber setup and trace export.

pub mod tracing_setup;

pub use tracing_setup::{TelemetryError, init_tracing, shutdown_tracing};
