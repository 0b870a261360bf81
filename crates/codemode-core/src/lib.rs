//! Codemode Core Library
//!
//! Lets generated code call tools on many MCP backends through one registry,
//! a middleware pipeline, and namespace proxies, and runs that code in a
//! capability-scoped subprocess sandbox.

pub mod bridge;
pub mod error;
pub mod fakes;
pub mod interceptor;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod sandbox;
pub mod telemetry;

pub use error::{CodemodeError, ConnectionError, ErrorKind, Result, SchemaError};

pub use registry::{
    BackendConfig, BackendConnection, BackendTransport, ConnectionEvent, ConnectionListener,
    ConnectionState, ListenerId, RetryPolicy, ServerRegistry, ToolDefinition, ToolSchema,
    TransportError, TransportFactory,
};

pub use interceptor::{
    CallContext, CallInterceptor, CallLogger, LoggingMiddleware, Middleware, Next,
    RateLimitMiddleware, TracingCallLogger, Validation, ValidationMiddleware,
};

pub use bridge::{
    CallBridge, Member, NamespaceDefinition, NamespaceProxy, ProxyConfig, ToolCallable,
};

pub use sandbox::{
    Capability, ExecutionMetrics, ExecutionOptions, ExecutionResult, ExecutionStatus, Permission,
    PermissionSet, SandboxConfig, SandboxExecutor, ScriptRuntime,
};

pub use metrics::METRICS;
pub use telemetry::{init_tracing, LogFormat};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
