//! Transport contract for backend tool-servers.
//!
//! The wire protocol is opaque to the registry: a transport only has to open,
//! close, list its tools, and answer request/response tool calls.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::config::{BackendConfig, ToolDefinition};

/// Failures reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("transport closed")]
    Closed,

    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// One live channel to a backend tool-server.
#[async_trait]
pub trait BackendTransport: Send + Sync + 'static {
    async fn open(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, TransportError>;
}

/// Builds a transport for a freshly registered backend.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self, config: &BackendConfig) -> Arc<dyn BackendTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&BackendConfig) -> Arc<dyn BackendTransport> + Send + Sync + 'static,
{
    fn create(&self, config: &BackendConfig) -> Arc<dyn BackendTransport> {
        self(config)
    }
}
