//! Connection-state change notifications.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

/// Emitted whenever a backend connects, fails to connect, or disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub server_id: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionEvent {
    pub fn connected(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            connected: true,
            error: None,
        }
    }

    pub fn disconnected(server_id: &str, error: Option<String>) -> Self {
        Self {
            server_id: server_id.to_string(),
            connected: false,
            error,
        }
    }
}

/// Handle returned by listener registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type ConnectionListener = Arc<dyn Fn(&ConnectionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Ordered listener list. Delivery isolates every listener: an error or panic
/// in one is logged and the rest still observe the event.
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, ConnectionListener)>>,
}

impl ListenerSet {
    pub(crate) async fn add(&self, listener: ConnectionListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().await.push((id, listener));
        id
    }

    pub(crate) async fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().await;
        let before = guard.len();
        guard.retain(|(lid, _)| *lid != id);
        guard.len() != before
    }

    pub(crate) async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub(crate) async fn emit(&self, event: &ConnectionEvent) {
        let snapshot: Vec<(ListenerId, ConnectionListener)> =
            self.listeners.read().await.iter().cloned().collect();

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = id.0, server_id = %event.server_id, error = %e, "connection listener failed");
                }
                Err(_) => {
                    warn!(listener = id.0, server_id = %event.server_id, "connection listener panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_faulty_listeners_do_not_block_others() {
        let set = ListenerSet::default();
        let seen = Arc::new(AtomicUsize::new(0));

        set.add(Arc::new(|_: &ConnectionEvent| -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }))
        .await;
        set.add(Arc::new(|_: &ConnectionEvent| -> anyhow::Result<()> {
            panic!("listener panicked")
        }))
        .await;
        let counter = seen.clone();
        set.add(Arc::new(move |ev: &ConnectionEvent| -> anyhow::Result<()> {
            assert_eq!(ev.server_id, "alpha");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .await;

        set.emit(&ConnectionEvent::connected("alpha")).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let set = ListenerSet::default();
        let id = set
            .add(Arc::new(|_: &ConnectionEvent| -> anyhow::Result<()> { Ok(()) }))
            .await;
        assert_eq!(set.len().await, 1);
        assert!(set.remove(id).await);
        assert!(!set.remove(id).await);
        assert_eq!(set.len().await, 0);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let ev = ConnectionEvent::disconnected("beta", Some("refused".into()));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["serverId"], "beta");
        assert_eq!(json["connected"], false);
        assert_eq!(json["error"], "refused");
    }
}
