//! Sandbox executor: capability-scoped script subprocesses with timeout and
//! memory enforcement.

pub mod config;
mod executor;
pub mod monitor;
pub mod permissions;
pub mod runtime;

pub use config::{ExecutionOptions, SandboxConfig};
pub use executor::{
    ExecutionFailure, ExecutionMetrics, ExecutionResult, ExecutionStatus, SandboxExecutor,
};
pub use permissions::{Capability, Permission, PermissionSet};
pub use runtime::{RuntimeKind, ScriptRuntime};
