//! Structured lifecycle events for registry, interceptor, and sandbox.
//!
//! Every event carries an `event = "<area>.<what>"` field so log pipelines can
//! filter without parsing messages. [`call_span`] ties nested logs to one
//! intercepted call; attach it with `tracing::Instrument` so it survives
//! across `.await` points.

use tracing::{debug, info, warn, Span};

/// Span tagged with the identity of one intercepted call.
pub fn call_span(call_id: &str, target: &str, method: &str) -> Span {
    tracing::info_span!(
        "codemode.call",
        call_id = %call_id,
        target = %target,
        method = %method
    )
}

/// Span for one sandbox execution.
pub fn execution_span(execution_id: &str) -> Span {
    tracing::info_span!("codemode.execution", execution_id = %execution_id)
}

pub fn emit_server_connected(server_id: &str, tool_count: usize) {
    info!(event = "registry.connected", server_id = %server_id, tool_count = tool_count);
}

pub fn emit_server_disconnected(server_id: &str, error: Option<&str>) {
    match error {
        None => info!(event = "registry.disconnected", server_id = %server_id),
        Some(e) => warn!(event = "registry.disconnected", server_id = %server_id, error = %e),
    }
}

pub fn emit_tool_routed(server_id: &str, tool: &str, duration_ms: u64, success: bool) {
    debug!(
        event = "registry.tool_routed",
        server_id = %server_id,
        tool = %tool,
        duration_ms = duration_ms,
        success = success,
    );
}

/// A proxy was built (or served from cache) for a namespace.
pub fn emit_proxy_created(namespace: &str, tool_count: usize, cached: bool) {
    debug!(
        event = "bridge.proxy_created",
        namespace = %namespace,
        tool_count = tool_count,
        cached = cached,
    );
}

pub fn emit_execution_started(execution_id: &str, script: &str, timeout_ms: u64) {
    info!(
        event = "sandbox.started",
        execution_id = %execution_id,
        script = %script,
        timeout_ms = timeout_ms,
    );
}

pub fn emit_execution_finished(
    execution_id: &str,
    status: &str,
    duration_ms: u64,
    memory_used_bytes: u64,
) {
    info!(
        event = "sandbox.finished",
        execution_id = %execution_id,
        status = %status,
        duration_ms = duration_ms,
        memory_used_bytes = memory_used_bytes,
    );
}

pub fn emit_cleanup_error(error: &dyn std::fmt::Display) {
    warn!(event = "sandbox.cleanup_error", error = %error);
}
