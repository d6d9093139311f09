/// Config schema types (sandbox, limits, api surface, resources).
use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptboxConfig {
    pub sandbox: SandboxConfig,
    pub limits: LimitsConfig,
    pub api: ApiConfig,
    pub resources: ResourcesConfig,
}

/// What happens when a script assigns a hook after its initialization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateHookPolicy {
    /// Ignore the assignment and record a diagnostic.
    #[default]
    Reject,
    /// Replace the handler for commands dispatched afterwards.
    Accept,
}

impl fmt::Display for LateHookPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => f.write_str("reject"),
            Self::Accept => f.write_str("accept"),
        }
    }
}

impl FromStr for LateHookPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "accept" => Ok(Self::Accept),
            other => Err(format!("unknown late hook policy: {other}")),
        }
    }
}

/// Per-session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Namespace for resource state. A random id is used when unset.
    pub id: Option<String>,
    /// Name reported in script error messages.
    pub script_name: String,
    pub late_hook_policy: LateHookPolicy,
    /// Maximum number of commands open at once. Defaults to 64.
    pub max_open_commands: usize,
    /// Abandon commands that stay open longer than this. Disabled when unset.
    pub command_timeout_ms: Option<u64>,
}

impl SandboxConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            id: None,
            script_name: "app".into(),
            late_hook_policy: LateHookPolicy::default(),
            max_open_commands: 64,
            command_timeout_ms: None,
        }
    }
}

/// Resource limits applied inside the isolation boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Memory available to the script state. Defaults to 32 MiB.
    pub memory_bytes: usize,
    /// VM instructions allowed per handler or callback invocation.
    pub instruction_budget: u64,
    /// Wall-clock limit per invocation in milliseconds.
    pub invocation_time_ms: u64,
}

impl LimitsConfig {
    pub fn invocation_time(&self) -> Duration {
        Duration::from_millis(self.invocation_time_ms)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 32 * 1024 * 1024,
            instruction_budget: 50_000_000,
            invocation_time_ms: 5_000,
        }
    }
}

/// The script-visible API surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Intrinsic operations to expose. All known intrinsics when unset.
    pub intrinsics: Option<Vec<String>>,
}

/// Host-side resources reachable through `request`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub log: LogResourceConfig,
    pub kv: KvResourceConfig,
    pub metrics: MetricsResourceConfig,
    pub config: ConfigResourceConfig,
    pub outbound: OutboundResourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogResourceConfig {
    pub enabled: bool,
}

impl Default for LogResourceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvResourceConfig {
    pub enabled: bool,
    /// Keys a sandbox may hold before writes are refused. Defaults to 100.
    pub keys_per_sandbox_hard: u64,
    /// Keys a sandbox may hold before warnings are logged.
    /// Defaults to 80% of the hard limit.
    pub keys_per_sandbox_soft: Option<u64>,
}

impl KvResourceConfig {
    pub fn soft_limit(&self) -> u64 {
        self.keys_per_sandbox_soft
            .unwrap_or(self.keys_per_sandbox_hard * 4 / 5)
    }
}

impl Default for KvResourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keys_per_sandbox_hard: 100,
            keys_per_sandbox_soft: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsResourceConfig {
    pub enabled: bool,
    /// Required when enabled; metric names become `<prefix>.stores.<store>.<metric>`.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigResourceConfig {
    pub enabled: bool,
    /// Configuration keys exposed to the script, each mapped to a file.
    pub keys: HashMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundResourceConfig {
    pub enabled: bool,
    /// Endpoints scripts may send through. `send_to` uses `default`.
    pub endpoints: Vec<String>,
    /// Keys scripts may set in `helper_metadata`. Empty forbids it.
    pub allowed_helper_metadata: Vec<String>,
}

impl Default for OutboundResourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoints: vec!["default".into()],
            allowed_helper_metadata: Vec::new(),
        }
    }
}
