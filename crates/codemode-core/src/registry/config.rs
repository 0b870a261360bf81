//! Backend configuration and tool schema types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static configuration for one backend tool-server.
///
/// Immutable once registered; replacing it requires remove + add.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Unique server identifier.
    pub id: String,
    /// Opaque endpoint handed to the transport factory.
    pub endpoint: String,
    /// Per-attempt RPC timeout (milliseconds).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries after the first failed attempt (0 = run once).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            display_name: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Name used in log lines.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// Capped, linearly increasing delay between tool-call attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(u64::from(attempt))
            .min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// Tool description as reported by a backend's catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: empty_object_schema(),
            output_schema: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A tool entry in the registry's flattened catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    /// Name as reported by the backend (never namespaced).
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    pub owner_backend_id: String,
}

impl ToolSchema {
    pub fn from_definition(def: ToolDefinition, owner: &str) -> Self {
        Self {
            name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            output_schema: def.output_schema,
            owner_backend_id: owner.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_config_defaults_from_json() {
        let cfg: BackendConfig =
            serde_json::from_str(r#"{"id":"github","endpoint":"stdio://gh"}"#).unwrap();
        assert_eq!(cfg.timeout_ms, 30_000);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.label(), "github");
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn test_backend_config_camel_case() {
        let cfg = BackendConfig::new("a", "mem://a")
            .with_timeout_ms(500)
            .with_display_name("Alpha");
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["timeoutMs"], 500);
        assert_eq!(json["displayName"], "Alpha");
        assert_eq!(cfg.label(), "Alpha");
    }

    #[test]
    fn test_retry_delay_is_linear_and_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 250,
        };
        assert_eq!(policy.delay_for(1).as_millis(), 100);
        assert_eq!(policy.delay_for(2).as_millis(), 200);
        assert_eq!(policy.delay_for(3).as_millis(), 250);
        assert_eq!(policy.delay_for(40).as_millis(), 250);
    }

    #[test]
    fn test_tool_definition_parses_mcp_shape() {
        let def: ToolDefinition = serde_json::from_str(
            r#"{"name":"getData","description":"Fetch","inputSchema":{"type":"object","properties":{"id":{"type":"string"}}}}"#,
        )
        .unwrap();
        assert_eq!(def.name, "getData");
        assert!(def.output_schema.is_none());
        let schema = ToolSchema::from_definition(def, "alpha");
        assert_eq!(schema.owner_backend_id, "alpha");
    }
}
