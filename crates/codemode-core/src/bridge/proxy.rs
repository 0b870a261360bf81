//! Namespace proxies: explicit member access over a backend's tools.
//!
//! A proxy never rejects a member name up front. Reserved introspection
//! members and custom properties resolve locally; every other name resolves
//! to a callable whose existence is checked only when it is invoked.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CodemodeError, Result};
use crate::interceptor::CallInterceptor;
use crate::registry::ToolSchema;

pub const NAMESPACE_MEMBER: &str = "__namespace";
pub const TOOLS_MEMBER: &str = "__tools";
pub const TO_STRING_MEMBER: &str = "toString";
pub const VALUE_OF_MEMBER: &str = "valueOf";

/// Options that shape a proxy. Part of the proxy cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Expose `__tools`.
    #[serde(default)]
    pub include_metadata: bool,
    /// Members answered with a fixed value instead of a tool call.
    #[serde(default)]
    pub custom_properties: BTreeMap<String, Value>,
}

impl ProxyConfig {
    pub fn with_metadata(mut self) -> Self {
        self.include_metadata = true;
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.custom_properties.insert(name.into(), value);
        self
    }
}

/// Generated-code grouping for one backend's tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceDefinition {
    pub name: String,
    pub server_id: String,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

/// Issue one call through the interceptor as `namespace.method`.
pub(crate) async fn bridged_call(
    interceptor: &CallInterceptor,
    namespace: &str,
    method: &str,
    args: Vec<Value>,
) -> Result<Value> {
    interceptor
        .intercept(namespace, method, args)
        .await
        .map_err(|e| CodemodeError::BridgeCallFailed {
            namespace: namespace.to_string(),
            method: method.to_string(),
            source: Box::new(e),
        })
}

/// A bound tool call: `namespace.method(args)`.
#[derive(Clone)]
pub struct ToolCallable {
    interceptor: Arc<CallInterceptor>,
    target: String,
    method: String,
}

impl ToolCallable {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        bridged_call(&self.interceptor, &self.target, &self.method, args).await
    }
}

impl fmt::Debug for ToolCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCallable")
            .field("target", &self.target)
            .field("method", &self.method)
            .finish()
    }
}

/// Result of reading a member from a [`NamespaceProxy`].
#[derive(Debug, Clone)]
pub enum Member {
    Namespace(String),
    Tools(Vec<String>),
    Text(String),
    Primitive(String),
    Custom(Value),
    Call(ToolCallable),
}

impl Member {
    pub fn into_callable(self) -> Option<ToolCallable> {
        match self {
            Member::Call(c) => Some(c),
            _ => None,
        }
    }
}

/// Stateless view of one namespace. Cheap to clone.
#[derive(Clone)]
pub struct NamespaceProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    namespace: String,
    target: String,
    config: ProxyConfig,
    tools: BTreeSet<String>,
    interceptor: Arc<CallInterceptor>,
}

impl NamespaceProxy {
    pub(crate) fn new(
        namespace: String,
        target: String,
        config: ProxyConfig,
        tools: BTreeSet<String>,
        interceptor: Arc<CallInterceptor>,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                namespace,
                target,
                config,
                tools,
                interceptor,
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Backend id calls are routed to.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Tool names discovered when the proxy was built.
    pub fn tools(&self) -> Vec<String> {
        self.inner.tools.iter().cloned().collect()
    }

    pub fn get(&self, member: &str) -> Member {
        let inner = &*self.inner;
        match member {
            NAMESPACE_MEMBER => return Member::Namespace(inner.namespace.clone()),
            TOOLS_MEMBER if inner.config.include_metadata => return Member::Tools(self.tools()),
            TO_STRING_MEMBER => return Member::Text(self.to_string()),
            VALUE_OF_MEMBER => return Member::Primitive(inner.namespace.clone()),
            _ => {}
        }
        if let Some(value) = inner.config.custom_properties.get(member) {
            return Member::Custom(value.clone());
        }
        Member::Call(self.callable(member))
    }

    /// Any member might be a tool, so this always holds.
    pub fn has(&self, _member: &str) -> bool {
        true
    }

    /// Reserved members, custom properties, then known tools.
    pub fn own_keys(&self) -> Vec<String> {
        let inner = &*self.inner;
        let mut keys = vec![NAMESPACE_MEMBER.to_string()];
        if inner.config.include_metadata {
            keys.push(TOOLS_MEMBER.to_string());
        }
        keys.push(TO_STRING_MEMBER.to_string());
        keys.push(VALUE_OF_MEMBER.to_string());
        keys.extend(inner.config.custom_properties.keys().cloned());
        keys.extend(
            inner
                .tools
                .iter()
                .filter(|t| !inner.config.custom_properties.contains_key(*t))
                .cloned(),
        );
        keys
    }

    /// Invoke `member` as a tool, whether or not it is known.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<Value> {
        bridged_call(&self.inner.interceptor, &self.inner.target, member, args).await
    }

    /// One typed callable per known tool.
    pub fn bind_tools(&self) -> BTreeMap<String, ToolCallable> {
        self.inner
            .tools
            .iter()
            .map(|t| (t.clone(), self.callable(t)))
            .collect()
    }

    fn callable(&self, method: &str) -> ToolCallable {
        ToolCallable {
            interceptor: self.inner.interceptor.clone(),
            target: self.inner.target.clone(),
            method: method.to_string(),
        }
    }
}

impl fmt::Display for NamespaceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[namespace {}]", self.inner.namespace)
    }
}

impl fmt::Debug for NamespaceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceProxy")
            .field("namespace", &self.inner.namespace)
            .field("target", &self.inner.target)
            .field("tools", &self.inner.tools)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeTransportFactory;
    use crate::registry::ServerRegistry;
    use serde_json::json;

    fn proxy(config: ProxyConfig, tools: &[&str]) -> NamespaceProxy {
        let registry = Arc::new(ServerRegistry::new(FakeTransportFactory::new()));
        NamespaceProxy::new(
            "github".into(),
            "github".into(),
            config,
            tools.iter().map(|t| t.to_string()).collect(),
            Arc::new(CallInterceptor::new(registry)),
        )
    }

    #[test]
    fn test_reserved_members_are_metadata() {
        let p = proxy(ProxyConfig::default().with_metadata(), &["listIssues"]);
        assert!(matches!(p.get("__namespace"), Member::Namespace(ns) if ns == "github"));
        assert!(matches!(p.get("__tools"), Member::Tools(t) if t == vec!["listIssues".to_string()]));
        assert!(matches!(p.get("toString"), Member::Text(s) if s == "[namespace github]"));
        assert!(matches!(p.get("valueOf"), Member::Primitive(s) if s == "github"));
    }

    #[test]
    fn test_tools_member_without_metadata_is_a_call() {
        let p = proxy(ProxyConfig::default(), &[]);
        assert!(matches!(p.get("__tools"), Member::Call(_)));
        assert!(!p.own_keys().contains(&"__tools".to_string()));
    }

    #[test]
    fn test_unknown_members_are_optimistic_calls() {
        let p = proxy(ProxyConfig::default(), &["listIssues"]);
        let callable = p.get("doesNotExist").into_callable().unwrap();
        assert_eq!(callable.method(), "doesNotExist");
        assert!(p.has("doesNotExist"));
        assert!(!p.own_keys().contains(&"doesNotExist".to_string()));
    }

    #[test]
    fn test_custom_property_wins_over_tool_name() {
        let p = proxy(
            ProxyConfig::default().with_property("listIssues", json!("stub")),
            &["listIssues", "createIssue"],
        );
        assert!(matches!(p.get("listIssues"), Member::Custom(v) if v == json!("stub")));
        assert_eq!(
            p.own_keys(),
            vec!["__namespace", "toString", "valueOf", "listIssues", "createIssue"]
        );
    }

    #[test]
    fn test_bind_tools_covers_known_tools() {
        let p = proxy(ProxyConfig::default(), &["a", "b"]);
        let bound = p.bind_tools();
        assert_eq!(bound.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(bound["b"].method(), "b");
    }
}
