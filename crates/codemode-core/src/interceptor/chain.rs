//! Middleware chain and terminal tool dispatch.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, Instrument};

use super::context::CallContext;
use crate::error::{CodemodeError, ConnectionError, Result, SchemaError};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::ServerRegistry;

/// One stage of the interception chain.
///
/// A stage either forwards with `next.run(ctx)` (optionally inspecting or
/// rewriting the result) or returns without calling it, which short-circuits
/// every later stage and the tool itself.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: CallContext, next: Next<'_>) -> Result<Value>;
}

/// Continuation to the rest of the chain.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    registry: &'a ServerRegistry,
}

impl<'a> Next<'a> {
    /// Run the remaining stages, then the tool dispatch.
    pub fn run(self, ctx: CallContext) -> BoxFuture<'a, Result<Value>> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    registry: self.registry,
                };
                stage.handle(ctx, next)
            }
            None => dispatch(self.registry, ctx).boxed(),
        }
    }
}

async fn dispatch(registry: &ServerRegistry, ctx: CallContext) -> Result<Value> {
    let args = ctx.tool_arguments();
    let target = ctx.target();

    if registry.has_server(target).await {
        if !registry.is_connected(target).await {
            return Err(ConnectionError::NotConnected {
                server_id: target.to_string(),
            }
            .into());
        }
        let name = registry
            .resolve_for_server(target, ctx.method())
            .await
            .ok_or_else(|| SchemaError::UnknownTool {
                name: format!("{target}.{}", ctx.method()),
            })?;
        debug!(target = %target, tool = %name, "dispatching to backend");
        return registry.call_tool(&name, args).await;
    }

    let name = if target.contains('.') {
        target
    } else {
        ctx.method()
    };
    registry.call_tool(name, args).await
}

/// Ordered middleware pipeline in front of [`ServerRegistry::call_tool`].
pub struct CallInterceptor {
    registry: Arc<ServerRegistry>,
    stages: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl CallInterceptor {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            stages: RwLock::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    fn read_stages(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn Middleware>>> {
        self.stages.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_stages(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn Middleware>>> {
        self.stages.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Append a stage to the end of the chain.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.write_stages().push(middleware);
    }

    /// Remove the first occurrence of this exact stage instance.
    pub fn remove_middleware(&self, middleware: &Arc<dyn Middleware>) -> bool {
        let target = Arc::as_ptr(middleware) as *const ();
        let mut stages = self.write_stages();
        match stages
            .iter()
            .position(|m| Arc::as_ptr(m) as *const () == target)
        {
            Some(idx) => {
                stages.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Remove the first stage reporting `name`.
    pub fn remove_middleware_named(&self, name: &str) -> bool {
        let mut stages = self.write_stages();
        match stages.iter().position(|m| m.name() == name) {
            Some(idx) => {
                stages.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn middleware_names(&self) -> Vec<String> {
        self.read_stages()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Run one call through the chain.
    ///
    /// The chain is snapshotted first, so `use_middleware` or
    /// `remove_middleware` during the call does not affect it. Every failure
    /// comes back as [`CodemodeError::Routing`] carrying the original cause.
    pub async fn intercept(&self, target: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let stages: Vec<Arc<dyn Middleware>> = self.read_stages().clone();
        let ctx = CallContext::new(target, method, args);
        let call_id = ctx.call_id().to_string();
        METRICS.inc_intercepted_calls();

        let next = Next {
            stages: &stages,
            registry: &self.registry,
        };
        next.run(ctx)
            .instrument(obs::call_span(&call_id, target, method))
            .await
            .map_err(|e| CodemodeError::routing(&call_id, target, method, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fakes::{FakeTransport, FakeTransportFactory};
    use crate::registry::BackendConfig;
    use serde_json::json;

    struct Tag(&'static str);

    #[async_trait]
    impl Middleware for Tag {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, ctx: CallContext, next: Next<'_>) -> Result<Value> {
            next.run(ctx).await
        }
    }

    async fn connected_registry() -> (Arc<ServerRegistry>, FakeTransportFactory) {
        let factory = FakeTransportFactory::new();
        factory.insert("alpha", FakeTransport::with_tool_names(&["getData"]));
        factory.insert("beta", FakeTransport::with_tool_names(&["getData", "search"]));
        let registry = Arc::new(ServerRegistry::new(factory.clone()));
        registry
            .add_server(BackendConfig::new("alpha", "mem://alpha"))
            .await
            .unwrap();
        registry
            .add_server(BackendConfig::new("beta", "mem://beta"))
            .await
            .unwrap();
        registry.connect_all().await.unwrap();
        (registry, factory)
    }

    #[tokio::test]
    async fn test_remove_middleware_by_identity() {
        let (registry, _) = connected_registry().await;
        let interceptor = CallInterceptor::new(registry);
        let a: Arc<dyn Middleware> = Arc::new(Tag("a"));
        let b: Arc<dyn Middleware> = Arc::new(Tag("a"));
        interceptor.use_middleware(a.clone());
        interceptor.use_middleware(b.clone());

        assert!(interceptor.remove_middleware(&b));
        assert!(!interceptor.remove_middleware(&b));
        assert_eq!(interceptor.middleware_names(), vec!["a".to_string()]);
        assert!(interceptor.remove_middleware_named("a"));
        assert!(interceptor.middleware_names().is_empty());
    }

    #[tokio::test]
    async fn test_backend_target_routes_to_its_own_entry() {
        let (registry, factory) = connected_registry().await;
        let interceptor = CallInterceptor::new(registry);

        interceptor
            .intercept("beta", "getData", vec![json!({"q": 1})])
            .await
            .unwrap();
        assert_eq!(factory.get("beta").unwrap().call_count(), 1);
        assert_eq!(factory.get("alpha").unwrap().call_count(), 0);
    }

    #[tokio::test]
    async fn test_dotted_target_is_a_tool_name() {
        let (registry, factory) = connected_registry().await;
        let interceptor = CallInterceptor::new(registry);

        let out = interceptor
            .intercept("beta.getData", "ignored", vec![json!({"q": 2})])
            .await
            .unwrap();
        assert_eq!(out["arguments"], json!({"q": 2}));
        assert_eq!(factory.get("beta").unwrap().call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_method_on_backend_is_schema_error() {
        let (registry, factory) = connected_registry().await;
        let interceptor = CallInterceptor::new(registry);

        let err = interceptor
            .intercept("alpha", "search", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CodemodeError::Routing { .. }));
        assert_eq!(err.root_cause().kind(), ErrorKind::Schema);
        assert_eq!(factory.get("beta").unwrap().call_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_backend_target_fails_with_connection_error() {
        let (registry, _) = connected_registry().await;
        registry.disconnect("alpha").await.unwrap();
        let interceptor = CallInterceptor::new(registry);

        let err = interceptor
            .intercept("alpha", "getData", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.root_cause().kind(), ErrorKind::Connection);
    }
}
