//! Registry of MCP backends and the flattened tool catalog.

pub mod config;
pub mod connection;
pub mod events;
mod server;
pub mod transport;

pub use config::{BackendConfig, RetryPolicy, ToolDefinition, ToolSchema};
pub use connection::{BackendConnection, ConnectionState};
pub use events::{ConnectionEvent, ConnectionListener, ListenerId};
pub use server::ServerRegistry;
pub use transport::{BackendTransport, TransportError, TransportFactory};
