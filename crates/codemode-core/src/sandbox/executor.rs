//! Runs untrusted scripts as supervised subprocesses.
//!
//! Each execution owns its subprocess, timer, and memory sampler. The first of
//! {exit, timeout, memory breach} decides the terminal state; the other two are
//! dropped and the process is hard-killed if it is still running.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use super::config::{reject_traversal, ExecutionOptions, SandboxConfig};
use super::monitor::MemorySampler;
use super::permissions::{Capability, Permission, PermissionSet};
use super::runtime::ScriptRuntime;
use crate::bridge::{channel, CallBridge};
use crate::error::{CodemodeError, ErrorKind, Result};
use crate::metrics::METRICS;
use crate::obs;

/// How long reader tasks may keep draining pipes after the process ends.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Env vars always passed through so the runtime itself can start.
const BASE_ENV: &[&str] = &["PATH", "HOME", "DENO_DIR"];

/// Terminal state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
    ResourceExceeded,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::ResourceExceeded => "resource_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
    /// Peak sampled resident size.
    pub memory_used_bytes: u64,
    /// Bridge call lines the script emitted.
    pub api_call_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one execution. `success == false` implies `result` is absent
/// and `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    fn succeeded(result: Value, metrics: ExecutionMetrics) -> Self {
        Self {
            success: true,
            status: ExecutionStatus::Succeeded,
            result: Some(result),
            error: None,
            metrics,
        }
    }

    fn failed(status: ExecutionStatus, message: String, metrics: ExecutionMetrics) -> Self {
        Self {
            success: false,
            status,
            result: None,
            error: Some(ExecutionFailure {
                kind: ErrorKind::Runtime,
                message,
            }),
            metrics,
        }
    }
}

enum Termination {
    Exited(ExitStatus),
    TimedOut,
    MemoryExceeded(u64),
}

/// Script output as structured data when it parses, trimmed text otherwise.
fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn child_env(permissions: &PermissionSet) -> HashMap<String, OsString> {
    let mut env: HashMap<String, OsString> = BASE_ENV
        .iter()
        .filter_map(|k| std::env::var_os(k).map(|v| (k.to_string(), v)))
        .collect();
    match permissions.get(Capability::Env) {
        Permission::Denied => {}
        Permission::Allowed => {
            env.extend(std::env::vars_os().filter_map(|(k, v)| k.into_string().ok().map(|k| (k, v))));
        }
        Permission::AllowList(names) => {
            env.extend(
                names
                    .iter()
                    .filter_map(|k| std::env::var_os(k).map(|v| (k.clone(), v))),
            );
        }
    }
    env
}

/// Drain stdout, answering bridge calls on stdin. Returns the remaining
/// output and the number of call lines seen.
///
/// Lines are read as raw bytes so non-UTF-8 output never stops the pump
/// before EOF; a stopped reader would leave the script writing into a
/// closed pipe.
async fn pump_stdout<R>(
    stdout: R,
    mut stdin: ChildStdin,
    bridge: Option<Arc<CallBridge>>,
) -> (String, u64)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut raw = Vec::new();
    let mut output = String::new();
    let mut calls = 0u64;

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "stdout read ended");
                break;
            }
        }
        let decoded = String::from_utf8_lossy(&raw);
        let line = decoded.trim_end_matches(['\n', '\r']);
        let Some(request) = channel::parse_call_line(line) else {
            output.push_str(line);
            output.push('\n');
            continue;
        };

        calls += 1;
        let reply = channel::answer(bridge.as_deref(), request).await;
        let encoded = match reply.encode() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to encode bridge reply");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(encoded.as_bytes()).await {
            debug!(error = %e, "script closed stdin before reply");
        } else if let Err(e) = stdin.flush().await {
            debug!(error = %e, "flush to script stdin failed");
        }
    }
    (output, calls)
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = String::new();
    if let Err(e) = reader.read_to_string(&mut buf).await {
        debug!(error = %e, "stderr read ended");
    }
    buf
}

async fn join_reader<T: Default>(handle: JoinHandle<T>, name: &str) -> T {
    let abort = handle.abort_handle();
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            warn!(reader = name, error = %e, "reader task failed");
            T::default()
        }
        Err(_) => {
            warn!(reader = name, "reader still open after process exit, abandoning");
            abort.abort();
            T::default()
        }
    }
}

/// SIGKILL the script's process group, taking any background children with it.
#[cfg(unix)]
fn kill_group(group: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = group.and_then(|g| i32::try_from(g).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(pgid, error = %e, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

async fn kill(child: &mut Child, group: Option<u32>) {
    kill_group(group);
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill signal failed (already exited?)");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap killed process");
    }
}

/// Supervised script runner with a lazily created scratch directory.
pub struct SandboxExecutor {
    config: RwLock<SandboxConfig>,
    runtime: ScriptRuntime,
    scratch: Mutex<Option<TempDir>>,
    bridge: Option<Arc<CallBridge>>,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            runtime: ScriptRuntime::default(),
            scratch: Mutex::new(None),
            bridge: None,
        })
    }

    pub fn with_runtime(mut self, runtime: ScriptRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Answer script bridge calls through `bridge`.
    pub fn with_bridge(mut self, bridge: Arc<CallBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    /// Copy of the live base configuration.
    pub fn get_config(&self) -> SandboxConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_permissions(&self, permissions: PermissionSet) {
        self.config
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .permissions = permissions;
    }

    /// Edit the base configuration. Rejected edits leave it unchanged.
    pub fn update_config<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut SandboxConfig),
    {
        let mut guard = self.config.write().unwrap_or_else(|p| p.into_inner());
        let mut next = guard.clone();
        edit(&mut next);
        next.validate()?;
        *guard = next;
        Ok(())
    }

    /// Scratch directory, created on first use and after `cleanup`.
    pub async fn scratch_dir(&self) -> Result<PathBuf> {
        let mut scratch = self.scratch.lock().await;
        if let Some(dir) = scratch.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new().prefix("codemode-").tempdir()?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "scratch directory created");
        *scratch = Some(dir);
        Ok(path)
    }

    /// Remove the scratch directory and everything in it. Safe to repeat;
    /// the next execution recreates it.
    pub async fn cleanup(&self) -> Result<()> {
        let taken = self.scratch.lock().await.take();
        if let Some(dir) = taken {
            if let Err(e) = dir.close() {
                obs::emit_cleanup_error(&e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Write `source` (with the runtime's bridge prelude) to a fresh scratch
    /// file and run it.
    pub async fn execute(
        &self,
        source: &str,
        options: Option<ExecutionOptions>,
    ) -> Result<ExecutionResult> {
        if let Some(dir) = &self.get_config().working_dir {
            reject_traversal(dir)?;
        }
        let dir = self.scratch_dir().await?;
        let path = dir.join(format!(
            "script-{}.{}",
            uuid::Uuid::new_v4(),
            self.runtime.extension
        ));
        let mut contents = String::with_capacity(source.len() + 1024);
        contents.push_str(self.runtime.prelude());
        contents.push_str(source);
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        tokio::fs::write(&path, contents).await?;

        let result = self.execute_file(&path, options).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "scratch file already gone");
        }
        result
    }

    /// Run an existing script file.
    ///
    /// Fails with `SecurityViolation` for paths containing `..` and with
    /// `InvalidInput` for the wrong extension or a missing file; both are
    /// checked before anything is spawned. Script failures are reported in
    /// the returned [`ExecutionResult`], not as errors.
    pub async fn execute_file(
        &self,
        path: impl AsRef<Path>,
        options: Option<ExecutionOptions>,
    ) -> Result<ExecutionResult> {
        let path = path.as_ref();
        reject_traversal(path)?;
        if !self.runtime.accepts(path) {
            return Err(CodemodeError::InvalidInput(format!(
                "{} is not a .{} script",
                path.display(),
                self.runtime.extension
            )));
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(CodemodeError::InvalidInput(format!(
                    "script not found: {}",
                    path.display()
                )))
            }
        }

        let options = options.unwrap_or_default();
        let config = self.get_config().merged(&options);
        config.validate()?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let capture = options.capture_metrics.unwrap_or(true);
        self.run(path, &config, &execution_id, capture)
            .instrument(obs::execution_span(&execution_id))
            .await
    }

    async fn run(
        &self,
        path: &Path,
        config: &SandboxConfig,
        execution_id: &str,
        capture: bool,
    ) -> Result<ExecutionResult> {
        obs::emit_execution_started(execution_id, &path.display().to_string(), config.timeout_ms);
        let started = Instant::now();

        let mut command = Command::new(&self.runtime.program);
        command
            .args(self.runtime.command_args(config, path))
            .env_clear()
            .envs(child_env(&config.permissions))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so limits can kill everything the script starts
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            CodemodeError::Runtime(format!("failed to spawn {}: {e}", self.runtime.program))
        })?;
        let group = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            kill(&mut child, group).await;
            return Err(CodemodeError::Runtime("subprocess pipes not captured".into()));
        };
        let stdout_task = tokio::spawn(pump_stdout(stdout, stdin, self.bridge.clone()));
        let stderr_task = tokio::spawn(drain(stderr));

        let mut sampler = group.map(MemorySampler::new);
        let deadline = tokio::time::sleep(Duration::from_millis(config.timeout_ms));
        tokio::pin!(deadline);
        let mut ticker =
            tokio::time::interval(Duration::from_millis(config.memory_sample_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let termination = loop {
            tokio::select! {
                status = child.wait() => {
                    // leftovers would hold the pipes open
                    kill_group(group);
                    break Termination::Exited(status?);
                }
                _ = &mut deadline => {
                    kill(&mut child, group).await;
                    break Termination::TimedOut;
                }
                _ = ticker.tick() => {
                    let used = sampler.as_mut().and_then(MemorySampler::sample);
                    if let Some(bytes) = used.filter(|b| *b > config.memory_limit_bytes) {
                        kill(&mut child, group).await;
                        break Termination::MemoryExceeded(bytes);
                    }
                }
            }
        };
        let duration_ms = (started.elapsed().as_millis() as u64).max(1);

        let (stdout, api_call_count) = join_reader(stdout_task, "stdout").await;
        let stderr = join_reader(stderr_task, "stderr").await;

        let metrics = ExecutionMetrics {
            duration_ms,
            memory_used_bytes: sampler.as_ref().map_or(0, MemorySampler::peak_bytes),
            api_call_count,
        };

        let result = match termination {
            Termination::Exited(status) if status.success() => {
                ExecutionResult::succeeded(parse_output(&stdout), metrics)
            }
            Termination::Exited(status) => {
                let detail = stderr.trim();
                let message = if detail.is_empty() {
                    format!("script exited with {status}")
                } else {
                    detail.to_string()
                };
                ExecutionResult::failed(ExecutionStatus::Failed, message, metrics)
            }
            Termination::TimedOut => ExecutionResult::failed(
                ExecutionStatus::TimedOut,
                format!("execution timed out after {}ms", config.timeout_ms),
                metrics,
            ),
            Termination::MemoryExceeded(bytes) => ExecutionResult::failed(
                ExecutionStatus::ResourceExceeded,
                format!(
                    "memory limit exceeded: {bytes} bytes used, limit {}",
                    config.memory_limit_bytes
                ),
                metrics,
            ),
        };

        if capture {
            METRICS.inc_executions();
            match result.status {
                ExecutionStatus::Succeeded => {}
                ExecutionStatus::Failed => METRICS.inc_execution_failures(),
                ExecutionStatus::TimedOut => METRICS.inc_timeouts(),
                ExecutionStatus::ResourceExceeded => METRICS.inc_resource_kills(),
            }
            obs::emit_execution_finished(
                execution_id,
                result.status.as_str(),
                metrics.duration_ms,
                metrics.memory_used_bytes,
            );
        }
        Ok(result)
    }
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("runtime", &self.runtime)
            .field("config", &self.get_config())
            .field("bridge", &self.bridge.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_output_prefers_json() {
        assert_eq!(parse_output("{\"a\": 1}\n"), json!({"a": 1}));
        assert_eq!(parse_output("  hello\n"), json!("hello"));
        assert_eq!(parse_output(""), Value::Null);
    }

    #[test]
    fn test_child_env_only_passes_granted_vars() {
        std::env::set_var("CODEMODE_TEST_SECRET", "s3cr3t");
        let denied = child_env(&PermissionSet::default());
        assert!(!denied.contains_key("CODEMODE_TEST_SECRET"));

        let listed = child_env(
            &PermissionSet::default()
                .with(Capability::Env, Permission::allow_list(["CODEMODE_TEST_SECRET"])),
        );
        assert_eq!(
            listed.get("CODEMODE_TEST_SECRET"),
            Some(&OsString::from("s3cr3t"))
        );
    }

    #[test]
    fn test_failed_result_shape() {
        let r = ExecutionResult::failed(
            ExecutionStatus::TimedOut,
            "timed out".into(),
            ExecutionMetrics::default(),
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["status"], "timed_out");
        assert_eq!(v["error"]["kind"], "runtime");
        assert!(v.get("result").is_none());
        assert!(v["metrics"].get("apiCallCount").is_some());
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid_edit() {
        let exec = SandboxExecutor::new(SandboxConfig::default()).unwrap();
        let err = exec.update_config(|c| c.timeout_ms = 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(exec.get_config().timeout_ms, 30_000);

        exec.update_config(|c| c.timeout_ms = 5).unwrap();
        assert_eq!(exec.get_config().timeout_ms, 5);
    }

    #[tokio::test]
    async fn test_set_permissions_replaces_base_grants() {
        let exec = SandboxExecutor::new(SandboxConfig::default()).unwrap();
        exec.set_permissions(
            PermissionSet::default().with(Capability::Net, Permission::allow_list(["example.com"])),
        );
        assert!(!exec.get_config().permissions.get(Capability::Net).is_denied());

        exec.set_permissions(PermissionSet::default());
        assert!(exec.get_config().permissions.get(Capability::Net).is_denied());
    }
}
