//! Error taxonomy shared across the registry, interceptor, bridge, and sandbox.
//!
//! Every failure that crosses a public boundary is a [`CodemodeError`]. Callers
//! branch on [`CodemodeError::kind`] instead of matching message text.

use serde::{Deserialize, Serialize};

/// Backend connection failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("server already registered: {server_id}")]
    DuplicateServer { server_id: String },

    #[error("server not registered: {server_id}")]
    ServerNotFound { server_id: String },

    #[error("server {server_id} unreachable: {reason}")]
    Unreachable { server_id: String, reason: String },

    #[error("server {server_id} is not connected")]
    NotConnected { server_id: String },

    #[error("failed to connect {} server(s): {}", failed.len(), failed.join(", "))]
    PartialConnectFailure { failed: Vec<String> },

    #[error("failed to disconnect {server_id}: {reason}")]
    DisconnectFailed { server_id: String, reason: String },
}

/// Tool catalog failures.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("failed to load tool catalog from {server_id}: {reason}")]
    CatalogFetch { server_id: String, reason: String },
}

/// Coarse classification of a [`CodemodeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Schema,
    Bridge,
    Runtime,
    SecurityViolation,
    InvalidInput,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Schema => "schema",
            ErrorKind::Bridge => "bridge",
            ErrorKind::Runtime => "runtime",
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::InvalidInput => "invalid_input",
        };
        f.write_str(s)
    }
}

/// Boundary error for all codemode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodemodeError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("routing failed for {target}.{method} (call {call_id}): {source}")]
    Routing {
        call_id: String,
        target: String,
        method: String,
        #[source]
        source: Box<CodemodeError>,
    },

    #[error("bridge call {namespace}.{method} failed: {source}")]
    BridgeCallFailed {
        namespace: String,
        method: String,
        #[source]
        source: Box<CodemodeError>,
    },

    #[error("tool {tool} on {server_id} failed after {attempts} attempt(s): {reason}")]
    ToolCall {
        server_id: String,
        tool: String,
        attempts: u32,
        reason: String,
    },

    #[error("middleware '{middleware}' rejected call: {reason}")]
    Rejected { middleware: String, reason: String },

    #[error("rate limit exceeded: {limit} calls per {window_ms}ms")]
    RateLimited { limit: usize, window_ms: u64 },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodemodeError {
    /// Classify this error. Wrappers report the kind of the wrapper itself,
    /// use [`CodemodeError::root_cause`] to classify the underlying failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodemodeError::Connection(_) => ErrorKind::Connection,
            CodemodeError::Schema(_) => ErrorKind::Schema,
            CodemodeError::Routing { .. }
            | CodemodeError::BridgeCallFailed { .. }
            | CodemodeError::ToolCall { .. }
            | CodemodeError::Rejected { .. }
            | CodemodeError::RateLimited { .. } => ErrorKind::Bridge,
            CodemodeError::Runtime(_) | CodemodeError::Io(_) => ErrorKind::Runtime,
            CodemodeError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            CodemodeError::InvalidInput(_) | CodemodeError::Serialization(_) => {
                ErrorKind::InvalidInput
            }
        }
    }

    /// Strip `Routing` and `BridgeCallFailed` wrappers.
    pub fn root_cause(&self) -> &CodemodeError {
        match self {
            CodemodeError::Routing { source, .. }
            | CodemodeError::BridgeCallFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub(crate) fn routing(
        call_id: &str,
        target: &str,
        method: &str,
        source: CodemodeError,
    ) -> Self {
        CodemodeError::Routing {
            call_id: call_id.to_string(),
            target: target.to_string(),
            method: method.to_string(),
            source: Box::new(source),
        }
    }
}

/// Result type for codemode operations.
pub type Result<T> = std::result::Result<T, CodemodeError>;
