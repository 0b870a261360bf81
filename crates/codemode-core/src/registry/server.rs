//! Server registry: owns backend connections and the flattened tool catalog.
//!
//! # Collision rule (first-write-wins)
//!
//! Catalogs are merged into one `name -> ToolSchema` map every time a backend
//! connects. A tool keeps its bare name if no *other* backend currently owns
//! that name; otherwise it is stored as `"<backendId>.<name>"`. The backend
//! that loaded first keeps the bare name and every later one is namespaced.
//! This is order-dependent on purpose and is part of the public contract.
//! [`ServerRegistry::connect_all`] applies catalogs in registration order so
//! the outcome is stable for a given sequence of `add_server` calls.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::config::{BackendConfig, ToolDefinition, ToolSchema};
use super::connection::BackendConnection;
use super::events::{ConnectionEvent, ConnectionListener, ListenerId, ListenerSet};
use super::transport::TransportFactory;
use crate::error::{CodemodeError, ConnectionError, Result, SchemaError};
use crate::metrics::METRICS;
use crate::obs;

/// Manages many backend connections and routes tool calls by name.
pub struct ServerRegistry {
    factory: Arc<dyn TransportFactory>,
    /// Registration order is preserved; it drives `connect_all` catalog order.
    servers: RwLock<Vec<Arc<BackendConnection>>>,
    tools: RwLock<HashMap<String, ToolSchema>>,
    listeners: ListenerSet,
}

impl ServerRegistry {
    pub fn new(factory: impl TransportFactory) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    pub fn with_factory(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            servers: RwLock::new(Vec::new()),
            tools: RwLock::new(HashMap::new()),
            listeners: ListenerSet::default(),
        }
    }

    async fn find(&self, id: &str) -> Option<Arc<BackendConnection>> {
        self.servers
            .read()
            .await
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    async fn require(&self, id: &str) -> Result<Arc<BackendConnection>> {
        self.find(id).await.ok_or_else(|| {
            ConnectionError::ServerNotFound {
                server_id: id.to_string(),
            }
            .into()
        })
    }

    /// Register a backend without connecting it.
    pub async fn add_server(&self, config: BackendConfig) -> Result<()> {
        if config.id.trim().is_empty() {
            return Err(CodemodeError::InvalidInput("server id must not be empty".into()));
        }
        if config.timeout_ms == 0 {
            return Err(CodemodeError::InvalidInput(format!(
                "server {}: timeoutMs must be greater than zero",
                config.id
            )));
        }

        let mut servers = self.servers.write().await;
        if servers.iter().any(|c| c.id() == config.id) {
            return Err(ConnectionError::DuplicateServer {
                server_id: config.id,
            }
            .into());
        }

        let transport = self.factory.create(&config);
        debug!(server_id = %config.id, label = %config.label(), "server registered");
        servers.push(Arc::new(BackendConnection::new(config, transport)));
        Ok(())
    }

    /// Remove a backend. Absent ids are a no-op; disconnect failures are
    /// logged and never block removal. A connect still in flight for the
    /// removed backend is discarded when it completes.
    pub async fn remove_server(&self, id: &str) {
        let removed = {
            let mut servers = self.servers.write().await;
            servers
                .iter()
                .position(|c| c.id() == id)
                .map(|idx| servers.remove(idx))
        };
        let Some(conn) = removed else {
            return;
        };

        let was_connected = conn.is_connected();
        if let Err(e) = conn.disconnect().await {
            warn!(server_id = %id, error = %e, "disconnect during removal failed");
        }
        self.purge_tools(id).await;
        if was_connected {
            self.listeners
                .emit(&ConnectionEvent::disconnected(id, None))
                .await;
        }
        info!(server_id = %id, "server removed");
    }

    /// Open one backend and reload its catalog.
    #[instrument(skip(self))]
    pub async fn connect(&self, id: &str) -> Result<()> {
        let conn = self.require(id).await?;
        let outcome = open_and_fetch(&conn).await;
        self.finish_connect(&conn, outcome).await
    }

    /// Connect every backend. Transports open concurrently; catalogs are
    /// applied in registration order. Fails with `PartialConnectFailure`
    /// listing every backend that did not connect.
    pub async fn connect_all(&self) -> Result<()> {
        let conns: Vec<Arc<BackendConnection>> = self.servers.read().await.clone();
        let outcomes = join_all(conns.iter().map(|c| open_and_fetch(c))).await;

        let mut failed = Vec::new();
        for (conn, outcome) in conns.iter().zip(outcomes) {
            match self.finish_connect(conn, outcome).await {
                Ok(()) => {}
                // removed while opening
                Err(CodemodeError::Connection(ConnectionError::ServerNotFound { .. })) => {}
                Err(_) => failed.push(conn.id().to_string()),
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ConnectionError::PartialConnectFailure { failed }.into())
        }
    }

    async fn finish_connect(
        &self,
        conn: &BackendConnection,
        outcome: Result<Vec<ToolDefinition>>,
    ) -> Result<()> {
        match outcome {
            Ok(tools) => {
                // Membership is checked under the servers lock and held across
                // the apply, so a concurrent remove_server cannot interleave.
                let servers = self.servers.read().await;
                if !servers.iter().any(|c| std::ptr::eq(c.as_ref(), conn)) {
                    drop(servers);
                    debug!(server_id = %conn.id(), "server removed while connecting, catalog discarded");
                    if let Err(e) = conn.disconnect().await {
                        warn!(server_id = %conn.id(), error = %e, "close of removed server failed");
                    }
                    return Err(ConnectionError::ServerNotFound {
                        server_id: conn.id().to_string(),
                    }
                    .into());
                }
                let count = self.apply_catalog(conn.id(), tools).await;
                drop(servers);

                obs::emit_server_connected(conn.id(), count);
                self.listeners
                    .emit(&ConnectionEvent::connected(conn.id()))
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(server_id = %conn.id(), error = %e, "connect failed");
                self.listeners
                    .emit(&ConnectionEvent::disconnected(conn.id(), Some(e.to_string())))
                    .await;
                Err(e)
            }
        }
    }

    /// Close one backend and drop its tools. Listeners hear about it only if
    /// the backend was connected.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let conn = self.require(id).await?;
        let was_connected = conn.is_connected();
        let result = conn.disconnect().await;
        self.purge_tools(id).await;

        if was_connected {
            let error = result.as_ref().err().map(|e| e.to_string());
            obs::emit_server_disconnected(id, error.as_deref());
            self.listeners
                .emit(&ConnectionEvent::disconnected(id, error))
                .await;
        }
        result.map_err(Into::into)
    }

    /// Close every backend and clear the whole catalog. Individual close
    /// failures are logged.
    pub async fn disconnect_all(&self) {
        let conns: Vec<Arc<BackendConnection>> = self.servers.read().await.clone();
        let was_connected: Vec<bool> = conns.iter().map(|c| c.is_connected()).collect();
        let results = join_all(conns.iter().map(|c| c.disconnect())).await;
        self.tools.write().await.clear();

        for ((conn, result), was_connected) in conns.iter().zip(results).zip(was_connected) {
            if !was_connected {
                continue;
            }
            let error = match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(server_id = %conn.id(), error = %e, "disconnect failed");
                    Some(e.to_string())
                }
            };
            obs::emit_server_disconnected(conn.id(), error.as_deref());
            self.listeners
                .emit(&ConnectionEvent::disconnected(conn.id(), error))
                .await;
        }
    }

    /// Replace `server_id`'s entries with `tools` under the collision rule.
    /// Returns the number of entries inserted.
    async fn apply_catalog(&self, server_id: &str, tools: Vec<ToolDefinition>) -> usize {
        let mut map = self.tools.write().await;
        map.retain(|_, schema| schema.owner_backend_id != server_id);

        let mut inserted = 0;
        for def in tools {
            let key = match map.get(&def.name) {
                None => def.name.clone(),
                Some(existing) if existing.owner_backend_id != server_id => {
                    format!("{server_id}.{}", def.name)
                }
                Some(_) => {
                    warn!(server_id = %server_id, tool = %def.name, "duplicate tool in catalog, skipped");
                    continue;
                }
            };
            if map.contains_key(&key) {
                warn!(server_id = %server_id, key = %key, "namespaced tool name already taken, skipped");
                continue;
            }
            map.insert(key, ToolSchema::from_definition(def, server_id));
            inserted += 1;
        }
        inserted
    }

    async fn purge_tools(&self, server_id: &str) {
        self.tools
            .write()
            .await
            .retain(|_, schema| schema.owner_backend_id != server_id);
    }

    /// Snapshot of the flattened catalog.
    pub async fn get_tool_schemas(&self) -> HashMap<String, ToolSchema> {
        self.tools.read().await.clone()
    }

    /// Catalog entries owned by one backend, keyed as they appear in the map.
    pub async fn tools_for_server(&self, server_id: &str) -> Vec<(String, ToolSchema)> {
        let mut entries: Vec<(String, ToolSchema)> = self
            .tools
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.owner_backend_id == server_id)
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Map key under which `server_id` exposes `method`, preferring the
    /// namespaced entry when the backend lost the bare name.
    pub async fn resolve_for_server(&self, server_id: &str, method: &str) -> Option<String> {
        let map = self.tools.read().await;
        let namespaced = format!("{server_id}.{method}");
        if map
            .get(&namespaced)
            .is_some_and(|s| s.owner_backend_id == server_id)
        {
            return Some(namespaced);
        }
        map.get(method)
            .filter(|s| s.owner_backend_id == server_id)
            .map(|_| method.to_string())
    }

    /// Route a tool call by catalog name. Arguments and result pass through
    /// unchanged.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let schema = self.tools.read().await.get(name).cloned().ok_or_else(|| {
            CodemodeError::from(SchemaError::UnknownTool {
                name: name.to_string(),
            })
        })?;

        let conn = self
            .find(&schema.owner_backend_id)
            .await
            .filter(|c| c.is_connected())
            .ok_or_else(|| ConnectionError::NotConnected {
                server_id: schema.owner_backend_id.clone(),
            })?;

        let (connects, drops) = (conn.connect_count(), conn.drop_count());
        let started = std::time::Instant::now();
        let result = conn.call_tool(&schema.name, args).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.sync_after_call(&conn, name, connects, drops).await;

        METRICS.inc_tool_calls();
        if result.is_err() {
            METRICS.inc_tool_call_failures();
        }
        obs::emit_tool_routed(conn.id(), name, duration_ms, result.is_ok());
        result
    }

    /// A call may drop the transport and reconnect it internally. Listeners
    /// hear about the drop, and a reconnect reloads the catalog and announces
    /// itself like any other connect.
    async fn sync_after_call(&self, conn: &BackendConnection, tool: &str, connects: u64, drops: u64) {
        if conn.drop_count() != drops {
            let reason = format!("connection lost during call to {tool}");
            obs::emit_server_disconnected(conn.id(), Some(&reason));
            self.listeners
                .emit(&ConnectionEvent::disconnected(conn.id(), Some(reason)))
                .await;
        }
        if conn.connect_count() != connects && conn.is_connected() {
            let outcome = fetch_catalog(conn).await;
            if let Err(e) = self.finish_connect(conn, outcome).await {
                warn!(server_id = %conn.id(), error = %e, "catalog reload after reconnect failed");
            }
        }
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.find(id).await.is_some_and(|c| c.is_connected())
    }

    pub async fn has_server(&self, id: &str) -> bool {
        self.find(id).await.is_some()
    }

    /// Registered ids in registration order.
    pub async fn get_server_ids(&self) -> Vec<String> {
        self.servers
            .read()
            .await
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    pub async fn on_connection_change(&self, listener: ConnectionListener) -> ListenerId {
        self.listeners.add(listener).await
    }

    pub async fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id).await
    }
}

async fn open_and_fetch(conn: &BackendConnection) -> Result<Vec<ToolDefinition>> {
    conn.connect().await?;
    fetch_catalog(conn).await
}

/// List tools on an open connection, closing it if the listing fails.
async fn fetch_catalog(conn: &BackendConnection) -> Result<Vec<ToolDefinition>> {
    match conn.list_tools().await {
        Ok(tools) => Ok(tools),
        Err(e) => {
            if let Err(close_err) = conn.disconnect().await {
                warn!(server_id = %conn.id(), error = %close_err, "close after catalog failure failed");
            }
            Err(e.into())
        }
    }
}
