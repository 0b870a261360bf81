//! Capability permissions for sandboxed scripts.
//!
//! Every capability is denied unless explicitly granted.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CodemodeError;

/// System resource classes a script may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Net,
    Read,
    Write,
    Env,
    Run,
    Hrtime,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Net,
        Capability::Read,
        Capability::Write,
        Capability::Env,
        Capability::Run,
        Capability::Hrtime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Net => "net",
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Env => "env",
            Capability::Run => "run",
            Capability::Hrtime => "hrtime",
        }
    }

    /// Whether grants can be narrowed to an allow-list.
    pub fn supports_allow_list(&self) -> bool {
        !matches!(self, Capability::Hrtime)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = CodemodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CodemodeError::InvalidInput(format!("unknown capability: {s}")))
    }
}

/// Grant for one capability. Serializes as `false`, `true`, or a string list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "PermissionRepr", into = "PermissionRepr")]
pub enum Permission {
    #[default]
    Denied,
    Allowed,
    AllowList(Vec<String>),
}

impl Permission {
    /// An empty list grants nothing and collapses to `Denied`.
    pub fn allow_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        if items.is_empty() {
            Permission::Denied
        } else {
            Permission::AllowList(items)
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Permission::Denied)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PermissionRepr {
    Flag(bool),
    List(Vec<String>),
}

impl From<PermissionRepr> for Permission {
    fn from(repr: PermissionRepr) -> Self {
        match repr {
            PermissionRepr::Flag(true) => Permission::Allowed,
            PermissionRepr::Flag(false) => Permission::Denied,
            PermissionRepr::List(items) => Permission::allow_list(items),
        }
    }
}

impl From<Permission> for PermissionRepr {
    fn from(p: Permission) -> Self {
        match p {
            Permission::Denied => PermissionRepr::Flag(false),
            Permission::Allowed => PermissionRepr::Flag(true),
            Permission::AllowList(items) => PermissionRepr::List(items),
        }
    }
}

static DENIED: Permission = Permission::Denied;

/// Capability -> grant. Missing entries are denied.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<Capability, Permission>",
    into = "BTreeMap<Capability, Permission>"
)]
pub struct PermissionSet {
    grants: BTreeMap<Capability, Permission>,
}

impl From<BTreeMap<Capability, Permission>> for PermissionSet {
    fn from(grants: BTreeMap<Capability, Permission>) -> Self {
        PermissionSet::default().overlay(&grants)
    }
}

impl From<PermissionSet> for BTreeMap<Capability, Permission> {
    fn from(set: PermissionSet) -> Self {
        set.grants
    }
}

impl PermissionSet {
    pub fn get(&self, capability: Capability) -> &Permission {
        self.grants.get(&capability).unwrap_or(&DENIED)
    }

    pub fn set(&mut self, capability: Capability, permission: Permission) {
        if permission.is_denied() {
            self.grants.remove(&capability);
        } else {
            self.grants.insert(capability, permission);
        }
    }

    pub fn with(mut self, capability: Capability, permission: Permission) -> Self {
        self.set(capability, permission);
        self
    }

    pub fn allow(self, capability: Capability) -> Self {
        self.with(capability, Permission::Allowed)
    }

    /// Capabilities that are not denied, in stable order.
    pub fn granted(&self) -> impl Iterator<Item = (Capability, &Permission)> {
        self.grants
            .iter()
            .filter(|(_, p)| !p.is_denied())
            .map(|(c, p)| (*c, p))
    }

    /// Apply per-capability overrides. Capabilities absent from `overrides`
    /// keep their grant; an explicit `Denied` revokes.
    pub fn overlay(&self, overrides: &BTreeMap<Capability, Permission>) -> PermissionSet {
        let mut out = self.clone();
        for (cap, perm) in overrides {
            out.set(*cap, perm.clone());
        }
        out
    }
}
