//! Registry behaviour against scripted in-memory backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use codemode_core::fakes::{FakeBehavior, FakeTransport, FakeTransportFactory};
use codemode_core::{
    BackendConfig, CodemodeError, ConnectionError, ConnectionEvent, ErrorKind, RetryPolicy,
    ServerRegistry, ToolDefinition, TransportError,
};
use serde_json::json;

fn factory_with(backends: &[(&str, Vec<&str>)]) -> FakeTransportFactory {
    let factory = FakeTransportFactory::new();
    for (id, tools) in backends {
        factory.insert(id, FakeTransport::with_tool_names(tools));
    }
    factory
}

async fn registry_for(backends: &[(&str, Vec<&str>)]) -> (ServerRegistry, FakeTransportFactory) {
    let factory = factory_with(backends);
    let registry = ServerRegistry::new(factory.clone());
    for (id, _) in backends {
        registry
            .add_server(BackendConfig::new(*id, format!("mem://{id}")))
            .await
            .unwrap();
    }
    (registry, factory)
}

#[tokio::test]
async fn test_server_ids_match_registrations() {
    let (registry, _) = registry_for(&[("c", vec![]), ("a", vec![]), ("b", vec![])]).await;
    let mut ids = registry.get_server_ids().await;
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_colliding_catalogs_keep_every_entry() {
    let (registry, _) = registry_for(&[
        ("first", vec!["getData", "listUsers"]),
        ("second", vec!["getData", "search"]),
    ])
    .await;

    registry.connect("first").await.unwrap();
    registry.connect("second").await.unwrap();

    let tools = registry.get_tool_schemas().await;
    assert_eq!(tools.len(), 4);
    assert_eq!(tools["getData"].owner_backend_id, "first");
    assert_eq!(tools["second.getData"].owner_backend_id, "second");
    assert!(tools.contains_key("search"));
    assert!(!tools.contains_key("first.getData"));
}

#[tokio::test]
async fn test_connect_all_is_deterministic_in_registration_order() {
    let (registry, _) =
        registry_for(&[("zeta", vec!["getData"]), ("alpha", vec!["getData"])]).await;
    registry.connect_all().await.unwrap();

    let tools = registry.get_tool_schemas().await;
    assert_eq!(tools["getData"].owner_backend_id, "zeta");
    assert!(tools.contains_key("alpha.getData"));
}

#[tokio::test]
async fn test_reconnect_reloads_catalog_wholesale() {
    let (registry, factory) = registry_for(&[("a", vec!["old"])]).await;
    registry.connect("a").await.unwrap();

    factory.get("a").unwrap().set_tools(vec![
        ToolDefinition::new("new").with_description("replacement"),
    ]);
    registry.connect("a").await.unwrap();

    let tools = registry.get_tool_schemas().await;
    assert!(!tools.contains_key("old"));
    assert_eq!(tools["new"].description, "replacement");
}

#[tokio::test]
async fn test_connect_all_reports_every_failed_backend() {
    let (registry, factory) =
        registry_for(&[("ok", vec!["t"]), ("bad1", vec![]), ("bad2", vec![])]).await;
    factory.get("bad1").unwrap().fail_open(true);
    factory.get("bad2").unwrap().fail_list(true);

    let err = registry.connect_all().await.unwrap_err();
    match err {
        CodemodeError::Connection(ConnectionError::PartialConnectFailure { failed }) => {
            assert_eq!(failed, vec!["bad1", "bad2"]);
        }
        other => panic!("expected PartialConnectFailure, got {other:?}"),
    }
    assert!(registry.is_connected("ok").await);
    assert!(!registry.is_connected("bad1").await);
    assert!(!registry.is_connected("bad2").await);
    assert!(registry.get_tool_schemas().await.contains_key("t"));
}

#[tokio::test]
async fn test_call_tool_error_kinds() {
    let (registry, factory) = registry_for(&[("a", vec!["echo"])]).await;
    registry.connect("a").await.unwrap();

    let unknown = registry.call_tool("nope", json!({})).await.unwrap_err();
    assert_eq!(unknown.kind(), ErrorKind::Schema);

    let args = json!({"nested": {"list": [1, 2, 3]}});
    factory.get("a").unwrap().respond("echo", json!({"ok": true}));
    let out = registry.call_tool("echo", args.clone()).await.unwrap();
    assert_eq!(out, json!({"ok": true}));
    assert_eq!(
        factory.get("a").unwrap().received(),
        vec![("echo".to_string(), args)]
    );

    registry.disconnect("a").await.unwrap();
    // catalog purged on disconnect, so the name is unknown again
    let gone = registry.call_tool("echo", json!({})).await.unwrap_err();
    assert_eq!(gone.kind(), ErrorKind::Schema);
}

#[tokio::test]
async fn test_owner_dropped_mid_session_is_connection_error() {
    let (registry, factory) = registry_for(&[("a", vec!["echo"])]).await;
    registry
        .add_server(BackendConfig::new("b", "mem://b").with_max_retries(0))
        .await
        .unwrap();
    factory.get("b").unwrap().set_tools(vec![ToolDefinition::new("flaky")]);
    registry.connect_all().await.unwrap();

    // transport-level failure with no retries left marks "b" disconnected
    let b = factory.get("b").unwrap();
    b.script(vec![FakeBehavior::Fail(TransportError::Closed)]);
    let first = registry.call_tool("flaky", json!({})).await.unwrap_err();
    assert_eq!(first.kind(), ErrorKind::Bridge);

    let second = registry.call_tool("flaky", json!({})).await.unwrap_err();
    assert_eq!(second.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn test_remove_server_is_idempotent_and_tolerates_close_failure() {
    let (registry, factory) = registry_for(&[("a", vec!["t"])]).await;
    registry.connect("a").await.unwrap();
    factory.get("a").unwrap().fail_close(true);

    registry.remove_server("a").await;
    registry.remove_server("a").await;
    registry.remove_server("never-added").await;

    assert!(registry.get_server_ids().await.is_empty());
    assert!(registry.get_tool_schemas().await.is_empty());
}

#[tokio::test]
async fn test_disconnect_all_clears_catalog() {
    let (registry, _) = registry_for(&[("a", vec!["x"]), ("b", vec!["y"])]).await;
    registry.connect_all().await.unwrap();
    registry.disconnect_all().await;

    assert!(registry.get_tool_schemas().await.is_empty());
    assert!(!registry.is_connected("a").await);
    assert!(!registry.is_connected("b").await);
}

fn record_events(seen: &Arc<Mutex<Vec<ConnectionEvent>>>) -> codemode_core::ConnectionListener {
    let sink = seen.clone();
    Arc::new(move |ev: &ConnectionEvent| -> anyhow::Result<()> {
        sink.lock().unwrap().push(ev.clone());
        Ok(())
    })
}

#[tokio::test]
async fn test_reconnect_inside_call_reloads_catalog_and_notifies() {
    let factory = factory_with(&[("a", vec!["old"])]);
    let registry = ServerRegistry::new(factory.clone());
    registry
        .add_server(
            BackendConfig::new("a", "mem://a")
                .with_max_retries(1)
                .with_retry(RetryPolicy {
                    base_delay_ms: 1,
                    max_delay_ms: 5,
                }),
        )
        .await
        .unwrap();
    let seen: Arc<Mutex<Vec<ConnectionEvent>>> = Arc::default();
    registry.on_connection_change(record_events(&seen)).await;
    registry.connect("a").await.unwrap();

    let a = factory.get("a").unwrap();
    a.set_tools(vec![ToolDefinition::new("old"), ToolDefinition::new("new")]);
    a.script(vec![FakeBehavior::Fail(TransportError::Closed), FakeBehavior::Echo]);

    registry.call_tool("old", json!({})).await.unwrap();
    assert_eq!(a.open_count(), 2);

    let events = seen.lock().unwrap().clone();
    let flags: Vec<bool> = events.iter().map(|e| e.connected).collect();
    assert_eq!(flags, vec![true, false, true]);
    assert!(events[1].error.as_deref().unwrap_or_default().contains("old"));

    let tools = registry.get_tool_schemas().await;
    assert!(tools.contains_key("new"));
    assert_eq!(tools["new"].owner_backend_id, "a");
}

#[tokio::test]
async fn test_drop_without_reconnect_is_announced() {
    let (registry, factory) = registry_for(&[]).await;
    registry
        .add_server(BackendConfig::new("b", "mem://b").with_max_retries(0))
        .await
        .unwrap();
    factory.get("b").unwrap().set_tools(vec![ToolDefinition::new("flaky")]);
    registry.connect("b").await.unwrap();
    let seen: Arc<Mutex<Vec<ConnectionEvent>>> = Arc::default();
    registry.on_connection_change(record_events(&seen)).await;

    factory
        .get("b")
        .unwrap()
        .script(vec![FakeBehavior::Fail(TransportError::Closed)]);
    registry.call_tool("flaky", json!({})).await.unwrap_err();

    let events = seen.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(!events[0].connected);
    assert_eq!(events[0].server_id, "b");
    assert!(!registry.is_connected("b").await);
}

#[tokio::test]
async fn test_removal_during_connect_discards_catalog() {
    let (registry, factory) = registry_for(&[("slow", vec!["t1", "t2"])]).await;
    let slow = factory.get("slow").unwrap();
    slow.delay_list(200);
    let registry = Arc::new(registry);

    let connecting = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.connect("slow").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    registry.remove_server("slow").await;

    let outcome = connecting.await.unwrap();
    assert!(matches!(
        outcome,
        Err(CodemodeError::Connection(ConnectionError::ServerNotFound { .. }))
    ));
    assert!(registry.get_server_ids().await.is_empty());
    assert!(registry.get_tool_schemas().await.is_empty());
    assert!(registry.tools_for_server("slow").await.is_empty());
    assert_eq!(slow.close_count(), 1);
}

#[tokio::test]
async fn test_disconnect_events_only_for_connected_servers() {
    let (registry, factory) = registry_for(&[("up", vec!["x"]), ("down", vec![]), ("idle", vec![])]).await;
    factory.get("down").unwrap().fail_open(true);
    registry.connect("up").await.unwrap();
    registry.connect("down").await.unwrap_err();

    let seen: Arc<Mutex<Vec<ConnectionEvent>>> = Arc::default();
    registry.on_connection_change(record_events(&seen)).await;

    registry.disconnect_all().await;
    registry.remove_server("down").await;
    registry.remove_server("idle").await;
    registry.disconnect("up").await.unwrap();

    let events = seen.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].server_id, "up");
    assert!(!events[0].connected);
}

#[tokio::test]
async fn test_listeners_observe_events_despite_faulty_peers() {
    let (registry, factory) = registry_for(&[("a", vec![]), ("b", vec![])]).await;
    factory.get("b").unwrap().fail_open(true);

    let seen: Arc<Mutex<Vec<ConnectionEvent>>> = Arc::default();
    let panics = Arc::new(AtomicUsize::new(0));

    let p = panics.clone();
    registry
        .on_connection_change(Arc::new(move |_: &ConnectionEvent| -> anyhow::Result<()> {
            p.fetch_add(1, Ordering::SeqCst);
            panic!("faulty listener");
        }))
        .await;
    let sink = seen.clone();
    let id = registry
        .on_connection_change(Arc::new(move |ev: &ConnectionEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(ev.clone());
            Ok(())
        }))
        .await;

    let _ = registry.connect_all().await;
    {
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].connected && events[0].server_id == "a");
        assert!(!events[1].connected && events[1].error.is_some());
    }
    assert_eq!(panics.load(Ordering::SeqCst), 2);

    assert!(registry.remove_connection_listener(id).await);
    registry.disconnect("a").await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}
