//! Call bridge: builds and caches namespace proxies over the interceptor.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::proxy::{bridged_call, NamespaceDefinition, NamespaceProxy, ProxyConfig};
use crate::error::Result;
use crate::interceptor::CallInterceptor;
use crate::obs;

type CacheKey = (String, String);

/// Namespace-level entry point for generated code.
pub struct CallBridge {
    interceptor: Arc<CallInterceptor>,
    definitions: Mutex<HashMap<String, NamespaceDefinition>>,
    cache: Mutex<HashMap<CacheKey, NamespaceProxy>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stable digest of a proxy config. `BTreeMap` keeps the encoding ordered.
fn config_digest(config: &ProxyConfig) -> Result<String> {
    let encoded = serde_json::to_vec(config)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

impl CallBridge {
    pub fn new(interceptor: Arc<CallInterceptor>) -> Self {
        Self {
            interceptor,
            definitions: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn interceptor(&self) -> &Arc<CallInterceptor> {
        &self.interceptor
    }

    /// Register (or replace) a generated namespace definition. Cached proxies
    /// for that namespace are dropped.
    pub fn register_namespace(&self, definition: NamespaceDefinition) {
        let name = definition.name.clone();
        lock(&self.definitions).insert(name.clone(), definition);
        lock(&self.cache).retain(|(ns, _), _| *ns != name);
    }

    /// Proxy for `namespace`, served from cache when one was built with an
    /// equal config. Concurrent builds for the same key may race; the last
    /// one stored wins.
    pub async fn create_proxy(
        &self,
        namespace: &str,
        config: Option<ProxyConfig>,
    ) -> Result<NamespaceProxy> {
        let config = config.unwrap_or_default();
        let key = (namespace.to_string(), config_digest(&config)?);

        let cached = lock(&self.cache).get(&key).cloned();
        if let Some(hit) = cached {
            obs::emit_proxy_created(namespace, hit.tools().len(), true);
            return Ok(hit);
        }

        let definition = lock(&self.definitions).get(namespace).cloned();
        let target = definition
            .as_ref()
            .map(|d| d.server_id.clone())
            .unwrap_or_else(|| namespace.to_string());

        let mut tools: BTreeSet<String> = self
            .interceptor
            .registry()
            .tools_for_server(&target)
            .await
            .into_iter()
            .map(|(_, schema)| schema.name)
            .collect();
        if let Some(def) = &definition {
            tools.extend(def.tools.iter().map(|t| t.name.clone()));
        }

        let proxy = NamespaceProxy::new(
            namespace.to_string(),
            target,
            config,
            tools,
            self.interceptor.clone(),
        );
        obs::emit_proxy_created(namespace, proxy.tools().len(), false);
        lock(&self.cache).insert(key, proxy.clone());
        Ok(proxy)
    }

    /// One proxy per namespace, in input order, all with the default config.
    pub async fn create_proxies(&self, namespaces: &[&str]) -> Result<Vec<NamespaceProxy>> {
        let mut proxies = Vec::with_capacity(namespaces.len());
        for ns in namespaces {
            proxies.push(self.create_proxy(ns, None).await?);
        }
        Ok(proxies)
    }

    /// Drop every cached proxy; the next access re-reads the registry.
    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    pub fn cached_proxy_count(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Route `target.method(args)` through the interceptor. Failures come back
    /// as `BridgeCallFailed` wrapping the original cause. A namespace
    /// registered with a different server id is routed to that server.
    pub async fn intercept_call(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let routed = lock(&self.definitions)
            .get(target)
            .map(|d| d.server_id.clone())
            .unwrap_or_else(|| target.to_string());
        bridged_call(&self.interceptor, &routed, method, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_depends_on_config() {
        let a = config_digest(&ProxyConfig::default()).unwrap();
        let b = config_digest(&ProxyConfig::default().with_metadata()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, config_digest(&ProxyConfig::default()).unwrap());
        assert_eq!(a.len(), 64);
    }
}
