//! Configuration validation.
//!
//! Checks a loaded [`ScriptboxConfig`] for values that would make a sandbox
//! unusable or surprising.

use std::fmt;

use crate::schema::ScriptboxConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "limits.memory_bytes"
    pub path: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.path, self.message)
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate a configuration.
pub fn validate(config: &ScriptboxConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.limits.memory_bytes == 0 {
        result.push(Severity::Error, "limits.memory_bytes", "must be greater than zero");
    }
    if config.limits.instruction_budget == 0 {
        result.push(
            Severity::Error,
            "limits.instruction_budget",
            "must be greater than zero",
        );
    }
    if config.limits.invocation_time_ms == 0 {
        result.push(
            Severity::Error,
            "limits.invocation_time_ms",
            "must be greater than zero",
        );
    }
    if config.sandbox.max_open_commands == 0 {
        result.push(
            Severity::Error,
            "sandbox.max_open_commands",
            "must be greater than zero, otherwise no command can be dispatched",
        );
    }
    if config.sandbox.command_timeout_ms == Some(0) {
        result.push(
            Severity::Warning,
            "sandbox.command_timeout_ms",
            "a zero timeout abandons every command immediately",
        );
    }
    if let Some(intrinsics) = &config.api.intrinsics
        && !intrinsics.iter().any(|name| name == "done")
    {
        result.push(
            Severity::Error,
            "api.intrinsics",
            "`done` must be exposed so handlers can complete commands",
        );
    }

    let kv = &config.resources.kv;
    if kv.enabled && kv.soft_limit() > kv.keys_per_sandbox_hard {
        result.push(
            Severity::Warning,
            "resources.kv.keys_per_sandbox_soft",
            format!(
                "soft limit {} is above the hard limit {}",
                kv.soft_limit(),
                kv.keys_per_sandbox_hard
            ),
        );
    }

    let metrics = &config.resources.metrics;
    if metrics.enabled && metrics.prefix.as_deref().is_none_or(str::is_empty) {
        result.push(
            Severity::Error,
            "resources.metrics.prefix",
            "required when the metrics resource is enabled",
        );
    }

    let outbound = &config.resources.outbound;
    if outbound.enabled && outbound.endpoints.is_empty() {
        result.push(
            Severity::Warning,
            "resources.outbound.endpoints",
            "no endpoints configured; every send will be refused",
        );
    }

    let files = &config.resources.config;
    if files.enabled {
        let mut keys: Vec<_> = files.keys.iter().collect();
        keys.sort();
        for (key, path) in keys {
            if !path.exists() {
                result.push(
                    Severity::Warning,
                    &format!("resources.config.keys.{key}"),
                    format!("file {} does not exist", path.display()),
                );
            }
        }
    }

    result
}
