//! Connector registry for runtime dispatch.
//!
//! A lookup table keyed by `(source, type)`. Step dispatch is one map lookup,
//! never a conditional chain over step kinds.

use std::collections::HashMap;
use std::sync::Arc;

use stagewright_types::workflow::SourceKind;

use super::boxed::BoxConnector;
use super::transform::{AggregateTransform, FilterTransform, JoinTransform, PassthroughTransform};
use super::Connector;

/// Registry of connectors indexed by `(source, type)`.
pub struct ConnectorRegistry {
    connectors: HashMap<(SourceKind, String), Arc<BoxConnector>>,
}

impl ConnectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Registry preloaded with the pure `transform` connectors:
    /// `passthrough`, `filter`, `join`, `aggregate`.
    pub fn with_builtin_transforms() -> Self {
        let mut registry = Self::new();
        registry.register(SourceKind::Transform, "passthrough", PassthroughTransform);
        registry.register(SourceKind::Transform, "filter", FilterTransform);
        registry.register(SourceKind::Transform, "join", JoinTransform);
        registry.register(SourceKind::Transform, "aggregate", AggregateTransform);
        registry
    }

    /// Register a connector for `(source, operation)`.
    ///
    /// If one is already registered for the pair, it is replaced.
    pub fn register<C: Connector + 'static>(
        &mut self,
        source: SourceKind,
        operation: impl Into<String>,
        connector: C,
    ) {
        self.register_boxed(source, operation, BoxConnector::new(connector));
    }

    pub fn register_boxed(
        &mut self,
        source: SourceKind,
        operation: impl Into<String>,
        connector: BoxConnector,
    ) {
        let operation = operation.into();
        tracing::debug!(
            source = %source,
            operation = operation.as_str(),
            connector = connector.name(),
            "registered connector"
        );
        self.connectors
            .insert((source, operation), Arc::new(connector));
    }

    /// Look up the connector for `(source, operation)`.
    pub fn get(&self, source: SourceKind, operation: &str) -> Option<Arc<BoxConnector>> {
        self.connectors
            .get(&(source, operation.to_string()))
            .cloned()
    }

    pub fn contains(&self, source: SourceKind, operation: &str) -> bool {
        self.connectors
            .contains_key(&(source, operation.to_string()))
    }

    /// All registered `(source, type)` pairs, sorted.
    pub fn list_keys(&self) -> Vec<(SourceKind, &str)> {
        let mut keys: Vec<(SourceKind, &str)> = self
            .connectors
            .keys()
            .map(|(source, op)| (*source, op.as_str()))
            .collect();
        keys.sort();
        keys
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
