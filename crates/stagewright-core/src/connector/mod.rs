//! Connector interface: the pluggable boundary to external systems.
//!
//! A connector serves one `(source, type)` pair. It receives a fully resolved
//! config and returns data plus an item count; it never sees the reference
//! resolver or the checkpoint store.

pub mod boxed;
pub mod registry;
pub mod transform;

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use stagewright_types::error::ErrorClass;

pub use boxed::{BoxConnector, ConnectorDyn};
pub use registry::ConnectorRegistry;

/// What a connector returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorOutput {
    pub data: Value,
    pub item_count: u64,
}

impl ConnectorOutput {
    /// Wrap `data`, counting array elements (or 1 for any other non-null value).
    pub fn new(data: Value) -> Self {
        let item_count = count_items(&data);
        Self { data, item_count }
    }

    pub fn with_count(data: Value, item_count: u64) -> Self {
        Self { data, item_count }
    }
}

/// Items in `data`: array length, 0 for null, 1 otherwise.
pub fn count_items(data: &Value) -> u64 {
    match data {
        Value::Array(items) => items.len() as u64,
        Value::Null => 0,
        _ => 1,
    }
}

/// Connector invocation failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    /// Transient failure, eligible for retry.
    #[error("{0}")]
    Retryable(String),

    /// Failure that retrying cannot fix (bad config, rejected request).
    #[error("{0}")]
    Permanent(String),

    /// The invocation exceeded its timeout. Treated as retryable.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        ConnectorError::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ConnectorError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectorError::Permanent(_))
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::Connector
    }
}

/// A connector for one `(source, type)` pair.
///
/// Uses RPITIT for the async method; wrap in [`BoxConnector`] for runtime
/// registration.
pub trait Connector: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Execute against a fully resolved config.
    fn invoke(
        &self,
        config: &Value,
    ) -> impl Future<Output = Result<ConnectorOutput, ConnectorError>> + Send;
}
