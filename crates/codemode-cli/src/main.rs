//! codemode - run scripts in the capability-scoped sandbox
//!
//! ## Commands
//!
//! - `run`: execute a script and print its `ExecutionResult` as JSON
//! - `check`: validate a script path without running it

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use codemode_core::{
    init_tracing, Capability, ExecutionOptions, LogFormat, Permission, PermissionSet,
    SandboxConfig, SandboxExecutor, ScriptRuntime, METRICS,
};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "codemode")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed code-mode script runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RuntimeArg {
    Deno,
    Shell,
}

impl RuntimeArg {
    fn runtime(self) -> ScriptRuntime {
        match self {
            RuntimeArg::Deno => ScriptRuntime::deno(),
            RuntimeArg::Shell => ScriptRuntime::shell(),
        }
    }
}

#[derive(clap::Args, Debug, Default)]
struct PermissionArgs {
    /// Allow network access, optionally only to the listed hosts
    #[arg(long, num_args = 0.., value_delimiter = ',', require_equals = true, value_name = "HOSTS")]
    allow_net: Option<Vec<String>>,

    /// Allow file reads, optionally only under the listed paths
    #[arg(long, num_args = 0.., value_delimiter = ',', require_equals = true, value_name = "PATHS")]
    allow_read: Option<Vec<String>>,

    /// Allow file writes, optionally only under the listed paths
    #[arg(long, num_args = 0.., value_delimiter = ',', require_equals = true, value_name = "PATHS")]
    allow_write: Option<Vec<String>>,

    /// Allow environment access, optionally only to the listed variables
    #[arg(long, num_args = 0.., value_delimiter = ',', require_equals = true, value_name = "VARS")]
    allow_env: Option<Vec<String>>,

    /// Allow running subprocesses, optionally only the listed commands
    #[arg(long, num_args = 0.., value_delimiter = ',', require_equals = true, value_name = "CMDS")]
    allow_run: Option<Vec<String>>,

    /// Allow high-resolution time
    #[arg(long)]
    allow_hrtime: bool,
}

fn grant(flag: &Option<Vec<String>>) -> Permission {
    match flag {
        None => Permission::Denied,
        Some(items) if items.is_empty() => Permission::Allowed,
        Some(items) => Permission::allow_list(items.iter().cloned()),
    }
}

impl PermissionArgs {
    fn to_permissions(&self) -> PermissionSet {
        let mut set = PermissionSet::default()
            .with(Capability::Net, grant(&self.allow_net))
            .with(Capability::Read, grant(&self.allow_read))
            .with(Capability::Write, grant(&self.allow_write))
            .with(Capability::Env, grant(&self.allow_env))
            .with(Capability::Run, grant(&self.allow_run));
        if self.allow_hrtime {
            set.set(Capability::Hrtime, Permission::Allowed);
        }
        set
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script and print the result as JSON
    Run {
        /// Script file
        file: PathBuf,

        /// Sandbox config JSON file; flags below override it
        #[arg(long, env = "CODEMODE_CONFIG")]
        config: Option<PathBuf>,

        /// Wall-clock limit in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Resident memory limit in bytes
        #[arg(long)]
        memory_limit_bytes: Option<u64>,

        /// Script runtime
        #[arg(long, value_enum, default_value_t = RuntimeArg::Deno)]
        runtime: RuntimeArg,

        #[command(flatten)]
        permissions: PermissionArgs,
    },

    /// Validate a script path and extension without running it
    Check {
        /// Script file
        file: PathBuf,

        /// Script runtime
        #[arg(long, value_enum, default_value_t = RuntimeArg::Deno)]
        runtime: RuntimeArg,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(format, level);

    match cli.command {
        Commands::Run {
            file,
            config,
            timeout_ms,
            memory_limit_bytes,
            runtime,
            permissions,
        } => {
            let base = load_config(config.as_deref())?;
            let options = ExecutionOptions {
                timeout_ms,
                memory_limit_bytes,
                ..ExecutionOptions::default()
            };
            cmd_run(&file, base, options, &permissions, runtime).await
        }
        Commands::Check { file, runtime } => cmd_check(&file, runtime),
    }
}

fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    let Some(path) = path else {
        return Ok(SandboxConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: SandboxConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid sandbox config {}", path.display()))?;
    Ok(config)
}

async fn cmd_run(
    file: &Path,
    mut base: SandboxConfig,
    options: ExecutionOptions,
    permissions: &PermissionArgs,
    runtime: RuntimeArg,
) -> Result<ExitCode> {
    base.permissions = base.permissions.overlay(&explicit_grants(permissions));
    debug!(
        file = %file.display(),
        timeout_ms = options.timeout_ms.unwrap_or(base.timeout_ms),
        "running script"
    );

    let executor = SandboxExecutor::new(base)?.with_runtime(runtime.runtime());
    let result = executor.execute_file(file, Some(options)).await;
    if let Err(e) = executor.cleanup().await {
        debug!(error = %e, "cleanup failed");
    }
    let result = result?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    METRICS.flush();
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Only flags the user actually passed override the config file.
fn explicit_grants(
    args: &PermissionArgs,
) -> std::collections::BTreeMap<Capability, Permission> {
    let flags = args.to_permissions();
    flags.granted().map(|(c, p)| (c, p.clone())).collect()
}

fn cmd_check(file: &Path, runtime: RuntimeArg) -> Result<ExitCode> {
    let runtime = runtime.runtime();
    if file
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("{}: path traversal is not allowed", file.display());
    }
    if !runtime.accepts(file) {
        anyhow::bail!(
            "{}: expected a .{} script",
            file.display(),
            runtime.extension
        );
    }
    if !file.is_file() {
        anyhow::bail!("{}: no such file", file.display());
    }
    println!("ok: {}", file.display());
    Ok(ExitCode::SUCCESS)
}
