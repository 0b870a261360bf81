//! Per-call context handed through the middleware chain.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Identity and arguments of one intercepted call.
///
/// A context is never mutated in place. Middleware that wants to change the
/// call forwards a modified copy built with the `with_*` methods; `call_id`
/// and `timestamp` survive every copy for correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    call_id: String,
    target: String,
    method: String,
    args: Vec<Value>,
    timestamp: i64,
}

impl CallContext {
    pub fn new(target: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            call_id: format!("call-{}", uuid::Uuid::new_v4()),
            target: target.into(),
            method: method.into(),
            args,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Milliseconds since the Unix epoch at creation.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The argument forwarded to the tool: the first positional argument, or
    /// an empty object when none was given.
    pub fn tool_arguments(&self) -> Value {
        self.args.first().cloned().unwrap_or_else(|| json!({}))
    }

    pub fn with_args(&self, args: Vec<Value>) -> Self {
        Self {
            args,
            ..self.clone()
        }
    }

    pub fn with_method(&self, method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..self.clone()
        }
    }

    pub fn with_target(&self, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_ids_are_unique() {
        let a = CallContext::new("alpha", "getData", vec![]);
        let b = CallContext::new("alpha", "getData", vec![]);
        assert_ne!(a.call_id(), b.call_id());
        assert!(a.call_id().starts_with("call-"));
    }

    #[test]
    fn test_modified_copy_keeps_identity() {
        let original = CallContext::new("alpha", "getData", vec![json!({"id": 1})]);
        let copy = original.with_args(vec![json!({"id": 2})]).with_method("getOther");

        assert_eq!(copy.call_id(), original.call_id());
        assert_eq!(copy.timestamp(), original.timestamp());
        assert_eq!(copy.method(), "getOther");
        assert_eq!(original.tool_arguments(), json!({"id": 1}));
        assert_eq!(copy.tool_arguments(), json!({"id": 2}));
    }

    #[test]
    fn test_missing_arguments_default_to_empty_object() {
        let ctx = CallContext::new("getData", "getData", vec![]);
        assert_eq!(ctx.tool_arguments(), json!({}));
    }
}
