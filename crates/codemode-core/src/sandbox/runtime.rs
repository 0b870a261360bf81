//! Script runtimes and how capability grants become command-line flags.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::config::SandboxConfig;
use super::permissions::{Permission, PermissionSet};

/// Which interpreter family a runtime belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Deno: enforces capabilities itself via `--allow-*` flags.
    Deno,
    /// POSIX `sh`. No capability enforcement; for development and tests.
    Shell,
}

/// Interpreter used to run scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRuntime {
    pub kind: RuntimeKind,
    pub program: String,
    /// Recognised script extension, without the dot.
    pub extension: String,
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::deno()
    }
}

const DENO_PRELUDE: &str = r#"const __codemodeDecoder = new TextDecoder();
let __codemodeBuffer = "";
let __codemodeNextId = 0;
async function __codemodeReadLine(): Promise<string> {
  const chunk = new Uint8Array(64 * 1024);
  while (true) {
    const nl = __codemodeBuffer.indexOf("\n");
    if (nl >= 0) {
      const line = __codemodeBuffer.slice(0, nl);
      __codemodeBuffer = __codemodeBuffer.slice(nl + 1);
      return line;
    }
    const n = await Deno.stdin.read(chunk);
    if (n === null) throw new Error("codemode bridge closed");
    __codemodeBuffer += __codemodeDecoder.decode(chunk.subarray(0, n), { stream: true });
  }
}
// deno-lint-ignore no-explicit-any
(globalThis as any).__codemodeCall = async (
  namespace: string,
  method: string,
  args: unknown[],
): Promise<unknown> => {
  const id = ++__codemodeNextId;
  console.log("__CODEMODE_CALL__ " + JSON.stringify({ id, namespace, method, args }));
  const reply = JSON.parse(await __codemodeReadLine());
  if (!reply.ok) throw new Error(`${reply.kind}: ${reply.error}`);
  return reply.result;
};
"#;

const SHELL_PRELUDE: &str = r#"codemode_call() {
  printf '__CODEMODE_CALL__ %s\n' "$1"
  IFS= read -r __codemode_reply
  printf '%s\n' "$__codemode_reply"
}
"#;

impl ScriptRuntime {
    pub fn deno() -> Self {
        Self {
            kind: RuntimeKind::Deno,
            program: "deno".into(),
            extension: "ts".into(),
        }
    }

    pub fn shell() -> Self {
        Self {
            kind: RuntimeKind::Shell,
            program: "sh".into(),
            extension: "sh".into(),
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
    }

    /// Source prepended to inline scripts; defines the bridge call helper.
    pub fn prelude(&self) -> &'static str {
        match self.kind {
            RuntimeKind::Deno => DENO_PRELUDE,
            RuntimeKind::Shell => SHELL_PRELUDE,
        }
    }

    /// Full argument list for running `script` under `config`.
    pub fn command_args(&self, config: &SandboxConfig, script: &Path) -> Vec<String> {
        let script = script.to_string_lossy().into_owned();
        match self.kind {
            RuntimeKind::Shell => vec![script],
            RuntimeKind::Deno => {
                let mut args = vec!["run".to_string(), "--no-prompt".to_string()];
                args.extend(capability_flags(&config.permissions));
                args.push(format!(
                    "--v8-flags=--max-old-space-size={}",
                    heap_megabytes(config.memory_limit_bytes)
                ));
                if !config.allowed_modules.is_empty() {
                    let modules: Vec<&str> =
                        config.allowed_modules.iter().map(String::as_str).collect();
                    args.push(format!("--allow-import={}", modules.join(",")));
                }
                args.push(script);
                args
            }
        }
    }
}

/// `--allow-<cap>` for full grants, `--allow-<cap>=a,b` for allow-lists,
/// nothing for denied capabilities.
pub fn capability_flags(permissions: &PermissionSet) -> Vec<String> {
    permissions
        .granted()
        .map(|(cap, perm)| match perm {
            Permission::AllowList(items) if cap.supports_allow_list() => {
                format!("--allow-{cap}={}", items.join(","))
            }
            _ => format!("--allow-{cap}"),
        })
        .collect()
}

fn heap_megabytes(bytes: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    bytes.div_ceil(MIB).max(1)
}
