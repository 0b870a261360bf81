//! In-memory fakes for the transport traits (testing and demos only)
//!
//! `FakeTransport` satisfies [`BackendTransport`] without any network I/O.
//! Each call consumes the next scripted [`FakeBehavior`]; once the script is
//! exhausted calls echo their arguments back.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::registry::config::{BackendConfig, ToolDefinition};
use crate::registry::transport::{BackendTransport, TransportError, TransportFactory};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the next `call_tool` does.
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Return `{"tool": name, "arguments": args}` (or a canned response).
    Echo,
    Return(Value),
    Fail(TransportError),
    /// Sleep for the given milliseconds, then echo.
    Sleep(u64),
}

#[derive(Debug, Default)]
struct FakeState {
    tools: Mutex<Vec<ToolDefinition>>,
    script: Mutex<VecDeque<FakeBehavior>>,
    responses: Mutex<HashMap<String, Value>>,
    received: Mutex<Vec<(String, Value)>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    calls: AtomicUsize,
    fail_open: AtomicBool,
    fail_open_after: Mutex<Option<usize>>,
    fail_close: AtomicBool,
    fail_list: AtomicBool,
    list_delay_ms: AtomicU64,
}

/// Scriptable in-memory backend. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        let transport = Self::default();
        *lock(&transport.state.tools) = tools;
        transport
    }

    /// Convenience: tools by name only.
    pub fn with_tool_names(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| ToolDefinition::new(*n)).collect())
    }

    /// Replace the advertised catalog (picked up on the next connect).
    pub fn set_tools(&self, tools: Vec<ToolDefinition>) {
        *lock(&self.state.tools) = tools;
    }

    /// Queue behaviours for upcoming calls.
    pub fn script(&self, steps: Vec<FakeBehavior>) {
        lock(&self.state.script).extend(steps);
    }

    /// Canned result for `Echo` calls to `tool`.
    pub fn respond(&self, tool: &str, value: Value) {
        lock(&self.state.responses).insert(tool.to_string(), value);
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Let `n` opens succeed, then fail every later one.
    pub fn fail_open_after(&self, n: usize) {
        *lock(&self.state.fail_open_after) = Some(n);
    }

    pub fn fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Hold every catalog listing for `ms` milliseconds.
    pub fn delay_list(&self, ms: u64) {
        self.state.list_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Every `(tool, args)` pair received, in order.
    pub fn received(&self) -> Vec<(String, Value)> {
        lock(&self.state.received).clone()
    }

    fn echo(&self, name: &str, args: Value) -> Value {
        match lock(&self.state.responses).get(name) {
            Some(v) => v.clone(),
            None => json!({ "tool": name, "arguments": args }),
        }
    }
}

#[async_trait]
impl BackendTransport for FakeTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let n = self.state.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("fake open failure".into()));
        }
        if let Some(limit) = *lock(&self.state.fail_open_after) {
            if n > limit {
                return Err(TransportError::Unreachable("fake open failure".into()));
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Rpc("fake close failure".into()));
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        let delay = self.state.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_list.load(Ordering::SeqCst) {
            return Err(TransportError::Malformed("fake catalog failure".into()));
        }
        Ok(lock(&self.state.tools).clone())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value, TransportError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.received).push((name.to_string(), args.clone()));
        let step = lock(&self.state.script)
            .pop_front()
            .unwrap_or(FakeBehavior::Echo);

        match step {
            FakeBehavior::Echo => Ok(self.echo(name, args)),
            FakeBehavior::Return(v) => Ok(v),
            FakeBehavior::Fail(e) => Err(e),
            FakeBehavior::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(self.echo(name, args))
            }
        }
    }
}

/// Hands out pre-built fakes by server id; unknown ids get an empty fake.
#[derive(Debug, Clone, Default)]
pub struct FakeTransportFactory {
    transports: Arc<Mutex<HashMap<String, FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server_id: &str, transport: FakeTransport) {
        lock(&self.transports).insert(server_id.to_string(), transport);
    }

    pub fn get(&self, server_id: &str) -> Option<FakeTransport> {
        lock(&self.transports).get(server_id).cloned()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(&self, config: &BackendConfig) -> Arc<dyn BackendTransport> {
        let transport = lock(&self.transports)
            .entry(config.id.clone())
            .or_default()
            .clone();
        Arc::new(transport)
    }
}
