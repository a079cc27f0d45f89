/// Execution policy: ceilings and permission lists for one execution.
///
/// A policy is validated once at construction (and on every
/// deserialization) and is immutable afterwards. The supervisor sizes the
/// wall-clock deadline from it; the worker derives its OS limits, engine
/// ceilings, primitive table and import guard from it.
use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;
pub const DEFAULT_CPU_TIME_SECONDS: u64 = 5;
pub const DEFAULT_MAX_OUTPUT_KB: u64 = 128;

/// Modules importable under the default policy.
pub const DEFAULT_ALLOWED_IMPORTS: &[&str] = &["json", "math", "stats", "time"];

/// Primitives callable under the default policy.
pub const DEFAULT_ALLOWED_BUILTINS: &[&str] = &[
    "bool", "debug", "exit", "float", "int", "len", "print", "round", "sorted", "str", "sum",
];

/// Permission list in one of two modes.
///
/// `Allow` is the secure baseline: only the named entries exist.
/// `Block` exposes everything the sandbox knows about except the named
/// entries; it is kept for callers migrating from block-list policies and
/// is never authoritative, since anything not named stays reachable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermissionList {
    Allow(BTreeSet<String>),
    Block(BTreeSet<String>),
}

impl PermissionList {
    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Allow(names.into_iter().map(Into::into).collect())
    }

    pub fn block<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Block(names.into_iter().map(Into::into).collect())
    }

    pub fn is_allow_list(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    pub fn names(&self) -> &BTreeSet<String> {
        match self {
            Self::Allow(names) | Self::Block(names) => names,
        }
    }

    /// Whether `name` is permitted.
    ///
    /// Dotted or slashed names are checked together with their ancestors:
    /// blocking `os` also blocks `os.path`, and allowing `os` allows
    /// `os.path`.
    pub fn permits(&self, name: &str) -> bool {
        let listed = ancestry(name).any(|candidate| self.names().contains(candidate));
        match self {
            Self::Allow(_) => listed,
            Self::Block(_) => !listed,
        }
    }
}

/// `a.b.c` yields `a.b.c`, `a.b`, `a`.
fn ancestry(name: &str) -> impl Iterator<Item = &str> {
    let mut current = Some(name);
    std::iter::from_fn(move || {
        let here = current?;
        current = here.rfind(|c: char| c == '.' || c == '/').map(|idx| &here[..idx]);
        Some(here)
    })
}

/// Validated execution policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicySpec", into = "PolicySpec")]
pub struct Policy {
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
    pub cpu_time_seconds: u64,
    pub max_output_kb: u64,
    pub imports: PermissionList,
    pub builtins: PermissionList,
    pub extra_globals: Map<String, Value>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_time_seconds: DEFAULT_CPU_TIME_SECONDS,
            max_output_kb: DEFAULT_MAX_OUTPUT_KB,
            imports: PermissionList::allow(DEFAULT_ALLOWED_IMPORTS.iter().copied()),
            builtins: PermissionList::allow(DEFAULT_ALLOWED_BUILTINS.iter().copied()),
            extra_globals: Map::new(),
        }
    }
}

impl Policy {
    /// Build a policy and fail fast on invalid ceilings.
    pub fn new(
        timeout_seconds: u64,
        memory_limit_mb: u64,
        cpu_time_seconds: u64,
        max_output_kb: u64,
    ) -> Result<Self> {
        let policy = Self {
            timeout_seconds,
            memory_limit_mb,
            cpu_time_seconds,
            max_output_kb,
            ..Self::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn with_imports(mut self, imports: PermissionList) -> Self {
        self.imports = imports;
        self
    }

    pub fn with_builtins(mut self, builtins: PermissionList) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn with_extra_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra_globals.insert(name.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let ceilings = [
            ("timeout_seconds", self.timeout_seconds),
            ("memory_limit_mb", self.memory_limit_mb),
            ("cpu_time_seconds", self.cpu_time_seconds),
            ("max_output_kb", self.max_output_kb),
        ];
        for (name, value) in ceilings {
            if value == 0 {
                return Err(SandboxError::Policy(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Wall-clock budget for the executed code.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_secs(self.cpu_time_seconds)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_output_bytes(&self) -> usize {
        usize::try_from(self.max_output_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
    }

    /// Load a policy from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            SandboxError::Policy(format!("invalid policy file {}: {e}", path.display()))
        })
    }
}

/// Wire form of [`Policy`]. Each permission list is spelled as exactly one
/// of `allowed_*` / `blocked_*`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PolicySpec {
    #[serde(default = "default_timeout")]
    timeout_seconds: u64,
    #[serde(default = "default_memory")]
    memory_limit_mb: u64,
    #[serde(default = "default_cpu")]
    cpu_time_seconds: u64,
    #[serde(default = "default_output")]
    max_output_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_imports: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blocked_imports: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_builtins: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blocked_builtins: Option<BTreeSet<String>>,
    #[serde(default)]
    extra_globals: Map<String, Value>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_memory() -> u64 {
    DEFAULT_MEMORY_LIMIT_MB
}

fn default_cpu() -> u64 {
    DEFAULT_CPU_TIME_SECONDS
}

fn default_output() -> u64 {
    DEFAULT_MAX_OUTPUT_KB
}

fn select_mode(
    field: &str,
    allowed: Option<BTreeSet<String>>,
    blocked: Option<BTreeSet<String>>,
    default: &[&str],
) -> Result<PermissionList> {
    match (allowed, blocked) {
        (Some(_), Some(_)) => Err(SandboxError::Policy(format!(
            "allowed_{field} and blocked_{field} are mutually exclusive"
        ))),
        (Some(names), None) => Ok(PermissionList::Allow(names)),
        (None, Some(names)) => Ok(PermissionList::Block(names)),
        (None, None) => Ok(PermissionList::allow(default.iter().copied())),
    }
}

impl TryFrom<PolicySpec> for Policy {
    type Error = SandboxError;

    fn try_from(spec: PolicySpec) -> Result<Self> {
        let policy = Policy {
            timeout_seconds: spec.timeout_seconds,
            memory_limit_mb: spec.memory_limit_mb,
            cpu_time_seconds: spec.cpu_time_seconds,
            max_output_kb: spec.max_output_kb,
            imports: select_mode(
                "imports",
                spec.allowed_imports,
                spec.blocked_imports,
                DEFAULT_ALLOWED_IMPORTS,
            )?,
            builtins: select_mode(
                "builtins",
                spec.allowed_builtins,
                spec.blocked_builtins,
                DEFAULT_ALLOWED_BUILTINS,
            )?,
            extra_globals: spec.extra_globals,
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl From<Policy> for PolicySpec {
    fn from(policy: Policy) -> Self {
        let mut spec = PolicySpec {
            timeout_seconds: policy.timeout_seconds,
            memory_limit_mb: policy.memory_limit_mb,
            cpu_time_seconds: policy.cpu_time_seconds,
            max_output_kb: policy.max_output_kb,
            extra_globals: policy.extra_globals,
            ..PolicySpec::default()
        };
        match policy.imports {
            PermissionList::Allow(names) => spec.allowed_imports = Some(names),
            PermissionList::Block(names) => spec.blocked_imports = Some(names),
        }
        match policy.builtins {
            PermissionList::Allow(names) => spec.allowed_builtins = Some(names),
            PermissionList::Block(names) => spec.blocked_builtins = Some(names),
        }
        spec
    }
}
