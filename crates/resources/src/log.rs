//! Logging resource.
//!
//! Script log lines are written to a [`LogSink`]. The default sink emits them
//! as tracing events under the `scriptbox::script` target; tests use
//! [`MemoryLogSink`] to observe what a script logged.

use std::{
    fmt,
    str::FromStr,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    anyhow::Result,
    async_trait::async_trait,
    scriptbox_common::{CommandId, Reply, Resource, ResourceContext},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::{debug, error, info, warn},
};

// ── LogLevel ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub const ALL: &'static [LogLevel] = &[
        Self::Debug,
        Self::Info,
        Self::Warning,
        Self::Error,
        Self::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| format!("unknown log level: {s}"))
    }
}

// ── LogSink ─────────────────────────────────────────────────────────────────

/// Backend that stores or forwards script log lines.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, ctx: &ResourceContext, level: LogLevel, message: &str) -> Result<()>;
}

/// Sink that turns script log lines into tracing events.
#[derive(Debug, Default)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn write(&self, ctx: &ResourceContext, level: LogLevel, message: &str) -> Result<()> {
        let sandbox = ctx.sandbox_id.as_str();
        let command = ctx.command_id.as_ref().map(CommandId::as_str);
        match level {
            LogLevel::Debug => {
                debug!(target: "scriptbox::script", sandbox, command, "{message}")
            },
            LogLevel::Info => info!(target: "scriptbox::script", sandbox, command, "{message}"),
            LogLevel::Warning => {
                warn!(target: "scriptbox::script", sandbox, command, "{message}")
            },
            LogLevel::Error => {
                error!(target: "scriptbox::script", sandbox, command, "{message}")
            },
            LogLevel::Critical => {
                error!(target: "scriptbox::script", sandbox, command, critical = true, "{message}")
            },
        }
        Ok(())
    }
}

/// One line captured by [`MemoryLogSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub command_id: Option<CommandId>,
}

/// Sink that keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
    failing: AtomicBool,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.message).collect()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write(&self, ctx: &ResourceContext, level: LogLevel, message: &str) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            anyhow::bail!("log sink unavailable");
        }
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(LogEntry {
                level,
                message: message.to_string(),
                command_id: ctx.command_id.clone(),
            });
        Ok(())
    }
}

// ── LoggingResource ─────────────────────────────────────────────────────────

/// The `log` resource: `log.info {msg = "..."}` and friends.
pub struct LoggingResource<S: ?Sized = dyn LogSink> {
    sink: std::sync::Arc<S>,
}

impl<S: LogSink + ?Sized> LoggingResource<S> {
    pub fn new(sink: std::sync::Arc<S>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S: LogSink + ?Sized> Resource for LoggingResource<S> {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, ctx: &ResourceContext, operation: &str, payload: Value) -> Result<Reply> {
        let Ok(level) = operation.parse::<LogLevel>() else {
            return Ok(Reply::failure(format!("Unknown operation: log.{operation}")));
        };
        let Some(message) = payload.get("msg").and_then(Value::as_str) else {
            return Ok(Reply::failure("Value expected for msg"));
        };
        match self.sink.write(ctx, level, message).await {
            Ok(()) => Ok(Reply::ok()),
            Err(e) => {
                warn!(sandbox = %ctx.sandbox_id, error = %e, "log sink write failed");
                Ok(Reply::failure(e.to_string()))
            },
        }
    }
}
