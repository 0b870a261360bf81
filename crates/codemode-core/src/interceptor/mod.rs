//! Call interception: an ordered middleware chain in front of tool dispatch.

pub mod builtin;
pub mod chain;
pub mod context;

pub use builtin::{
    CallLogger, LoggingMiddleware, RateLimitMiddleware, TracingCallLogger, Validation,
    ValidationMiddleware,
};
pub use chain::{CallInterceptor, Middleware, Next};
pub use context::CallContext;
