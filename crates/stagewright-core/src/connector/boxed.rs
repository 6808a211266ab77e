//! BoxConnector -- object-safe dynamic dispatch wrapper for Connector.
//!
//! 1. `ConnectorDyn` is an object-safe mirror of `Connector` with boxed futures.
//! 2. Every `T: Connector` gets `ConnectorDyn` through a blanket impl.
//! 3. `BoxConnector` wraps `Box<dyn ConnectorDyn>` and delegates.

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::{Connector, ConnectorError, ConnectorOutput};

/// Object-safe version of [`Connector`] with boxed futures.
pub trait ConnectorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        config: &'a Value,
    ) -> BoxFuture<'a, Result<ConnectorOutput, ConnectorError>>;
}

impl<T: Connector> ConnectorDyn for T {
    fn name(&self) -> &str {
        Connector::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        config: &'a Value,
    ) -> BoxFuture<'a, Result<ConnectorOutput, ConnectorError>> {
        Box::pin(self.invoke(config))
    }
}

/// Type-erased connector for registry storage.
///
/// `Connector` uses RPITIT and cannot be a trait object directly;
/// `BoxConnector` exposes the same surface over a `ConnectorDyn` object.
pub struct BoxConnector {
    inner: Box<dyn ConnectorDyn>,
}

impl BoxConnector {
    pub fn new<T: Connector + 'static>(connector: T) -> Self {
        Self {
            inner: Box::new(connector),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn invoke(&self, config: &Value) -> Result<ConnectorOutput, ConnectorError> {
        self.inner.invoke_boxed(config).await
    }
}
