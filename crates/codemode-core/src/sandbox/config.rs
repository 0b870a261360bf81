//! Sandbox configuration and per-execution overrides.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::permissions::{Capability, Permission, PermissionSet};
use crate::error::{CodemodeError, Result};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 128 * 1024 * 1024;
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_memory_limit_bytes() -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_sample_interval_ms() -> u64 {
    DEFAULT_SAMPLE_INTERVAL_MS
}

/// Base configuration of a [`SandboxExecutor`](super::SandboxExecutor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,
    #[serde(default)]
    pub permissions: PermissionSet,
    /// Remote module specifiers the script may import.
    #[serde(default)]
    pub allowed_modules: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// How often the memory sampler polls the subprocess.
    #[serde(default = "default_sample_interval_ms")]
    pub memory_sample_interval_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            permissions: PermissionSet::default(),
            allowed_modules: BTreeSet::new(),
            working_dir: None,
            memory_sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
        }
    }
}

impl SandboxConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(CodemodeError::InvalidInput(
                "timeoutMs must be greater than zero".into(),
            ));
        }
        if self.memory_limit_bytes == 0 {
            return Err(CodemodeError::InvalidInput(
                "memoryLimitBytes must be greater than zero".into(),
            ));
        }
        if self.memory_sample_interval_ms == 0 {
            return Err(CodemodeError::InvalidInput(
                "memorySampleIntervalMs must be greater than zero".into(),
            ));
        }
        if let Some(dir) = &self.working_dir {
            reject_traversal(dir)?;
        }
        Ok(())
    }

    /// Copy of this config with `options` applied field by field.
    pub fn merged(&self, options: &ExecutionOptions) -> SandboxConfig {
        let mut out = self.clone();
        if let Some(t) = options.timeout_ms {
            out.timeout_ms = t;
        }
        if let Some(m) = options.memory_limit_bytes {
            out.memory_limit_bytes = m;
        }
        if let Some(p) = &options.permissions {
            out.permissions = out.permissions.overlay(p);
        }
        out
    }
}

/// Per-execution overrides. Unset fields inherit from the base config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    /// Per-capability overrides; `false` revokes a base grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<BTreeMap<Capability, Permission>>,
    /// Emit execution metrics to logs and process counters. The result
    /// always carries metrics regardless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_metrics: Option<bool>,
}

impl ExecutionOptions {
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn permission(mut self, capability: Capability, permission: Permission) -> Self {
        self.permissions
            .get_or_insert_with(BTreeMap::new)
            .insert(capability, permission);
        self
    }
}

/// Any `..` component is a traversal attempt.
pub(crate) fn reject_traversal(path: &Path) -> Result<()> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CodemodeError::SecurityViolation(format!(
            "path traversal rejected: {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_defaults_from_empty_json() {
        let cfg: SandboxConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(cfg, SandboxConfig::default());
        assert_eq!(cfg.memory_limit_bytes, 134_217_728);
    }

    #[test]
    fn test_merge_overrides_fields_without_touching_base() {
        let base = SandboxConfig::default()
            .with_permissions(PermissionSet::default().allow(Capability::Env));
        let opts = ExecutionOptions::default()
            .timeout_ms(500)
            .permission(Capability::Net, Permission::allow_list(["example.com"]));

        let merged = base.merged(&opts);
        assert_eq!(merged.timeout_ms, 500);
        assert_eq!(merged.memory_limit_bytes, DEFAULT_MEMORY_LIMIT_BYTES);
        assert_eq!(merged.permissions.get(Capability::Env), &Permission::Allowed);
        assert!(!merged.permissions.get(Capability::Net).is_denied());
        assert_eq!(base.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(base.permissions.get(Capability::Net).is_denied());
    }

    #[test]
    fn test_validate_rejects_zero_limits_and_traversal() {
        let zero = SandboxConfig::default().with_timeout_ms(0);
        assert_eq!(zero.validate().unwrap_err().kind(), ErrorKind::InvalidInput);

        let escape = SandboxConfig::default().with_working_dir("work/../../etc");
        assert_eq!(
            escape.validate().unwrap_err().kind(),
            ErrorKind::SecurityViolation
        );
    }

    #[test]
    fn test_options_wire_format() {
        let opts: ExecutionOptions = serde_json::from_value(json!({
            "timeoutMs": 1000,
            "permissions": {"net": false, "read": ["./data"]},
            "captureMetrics": false
        }))
        .unwrap();
        assert_eq!(opts.timeout_ms, Some(1000));
        assert_eq!(opts.capture_metrics, Some(false));
        let perms = opts.permissions.unwrap();
        assert_eq!(perms[&Capability::Net], Permission::Denied);
    }
}
