//! One backend connection: state machine, bounded reconnect, retried RPC.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::config::{BackendConfig, ToolDefinition};
use super::transport::{BackendTransport, TransportError};
use crate::error::{CodemodeError, ConnectionError, SchemaError};

/// Lifecycle of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Owns the transport for one backend.
///
/// Invariant: `state() == Connected` only while the transport accepted `open`
/// and no call has since failed at the transport level.
///
/// `connects` and `drops` count successful opens and call-time transport
/// losses, so the registry can tell when a call reconnected underneath it.
pub struct BackendConnection {
    config: BackendConfig,
    transport: Arc<dyn BackendTransport>,
    state: AtomicU8,
    reconnect_attempts: AtomicU32,
    connects: AtomicU64,
    drops: AtomicU64,
}

impl BackendConnection {
    pub fn new(config: BackendConfig, transport: Arc<dyn BackendTransport>) -> Self {
        Self {
            config,
            transport,
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            reconnect_attempts: AtomicU32::new(0),
            connects: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnects attempted since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Connected -> Disconnected after a transport failure mid-call.
    fn mark_dropped(&self) {
        let previous = self
            .state
            .swap(ConnectionState::Disconnected.as_u8(), Ordering::SeqCst);
        if previous == ConnectionState::Connected.as_u8() {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Open the transport. Disconnected/Failed -> Connecting -> Connected/Failed.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connecting);
        debug!(server_id = %self.config.id, endpoint = %self.config.endpoint, "opening transport");

        let outcome = match tokio::time::timeout(self.timeout(), self.transport.open()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("open timed out after {}ms", self.config.timeout_ms)),
        };

        match outcome {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(reason) => {
                self.set_state(ConnectionState::Failed);
                Err(ConnectionError::Unreachable {
                    server_id: self.config.id.clone(),
                    reason,
                })
            }
        }
    }

    /// Close the transport. The connection ends up Disconnected even when
    /// `close` fails; the failure is still reported.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let result = self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        result.map_err(|e| ConnectionError::DisconnectFailed {
            server_id: self.config.id.clone(),
            reason: e.to_string(),
        })
    }

    /// Fetch the backend's tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, SchemaError> {
        let fetched = tokio::time::timeout(self.timeout(), self.transport.list_tools()).await;
        match fetched {
            Ok(Ok(tools)) => Ok(tools),
            Ok(Err(e)) => Err(SchemaError::CatalogFetch {
                server_id: self.config.id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(SchemaError::CatalogFetch {
                server_id: self.config.id.clone(),
                reason: format!("timed out after {}ms", self.config.timeout_ms),
            }),
        }
    }

    async fn reconnect(&self) -> Result<(), ConnectionError> {
        let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > self.config.max_retries {
            return Err(ConnectionError::Unreachable {
                server_id: self.config.id.clone(),
                reason: format!("reconnect limit reached ({})", self.config.max_retries),
            });
        }
        debug!(server_id = %self.config.id, attempt = attempts, "reconnecting");
        self.connect().await
    }

    /// Call a tool with the configured timeout and bounded retry.
    ///
    /// A transport-level failure marks the connection disconnected before the
    /// next attempt, which then reconnects first.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, CodemodeError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected {
                server_id: self.config.id.clone(),
            }
            .into());
        }

        let max_attempts = self.config.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if !self.is_connected() {
                if let Err(e) = self.reconnect().await {
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
                    }
                    continue;
                }
            }

            let call = self.transport.call_tool(name, args.clone());
            match tokio::time::timeout(self.timeout(), call).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if matches!(e, TransportError::Unreachable(_) | TransportError::Closed) {
                        self.mark_dropped();
                    }
                    last_error = e.to_string();
                }
                Err(_) => {
                    self.mark_dropped();
                    last_error = format!("timed out after {}ms", self.config.timeout_ms);
                }
            }

            warn!(
                server_id = %self.config.id,
                tool = %name,
                attempt = attempt,
                max_attempts = max_attempts,
                error = %last_error,
                "tool call attempt failed"
            );

            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
            }
        }

        Err(CodemodeError::ToolCall {
            server_id: self.config.id.clone(),
            tool: name.to_string(),
            attempts: max_attempts,
            reason: last_error,
        })
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.config.id)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}
