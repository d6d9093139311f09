use std::fmt;

use {
    scriptbox_common::{CommandId, SessionId},
    serde::Serialize,
    thiserror::Error,
};

// ── LoadError ───────────────────────────────────────────────────────────────

/// The script could not be turned into a ready session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("syntax error in {script}: {message}")]
    Syntax { script: String, message: String },

    #[error("initialization of {script} failed: {message}")]
    Initialization { script: String, message: String },

    #[error("isolation context could not be created: {message}")]
    Boundary { message: String },
}

impl LoadError {
    #[must_use]
    pub fn boundary(message: impl Into<String>) -> Self {
        Self::Boundary {
            message: message.into(),
        }
    }
}

// ── SchemaError ─────────────────────────────────────────────────────────────

/// An intrinsic or hook name outside the api schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown intrinsic `{name}` (api schema v{version})")]
    UnknownIntrinsic { name: String, version: u32 },

    #[error("intrinsic `{name}` must be exposed")]
    MissingIntrinsic { name: &'static str },

    #[error("unknown hook `{name}`")]
    UnknownHook { name: String },

    #[error("hook `{name}` must be a function, got {type_name}")]
    InvalidHook { name: String, type_name: String },
}

// ── ExecutionFault ──────────────────────────────────────────────────────────

/// How far the damage of a fault reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultScope {
    /// Only the command being processed fails.
    Command,
    /// The isolation context can no longer be trusted.
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A script error, raised explicitly or by the VM.
    Script,
    InstructionBudget,
    TimeLimit,
    StackOverflow,
    Memory,
    /// Host-side failures: registry corruption, conversion bugs, panics.
    Internal,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Script => "script error",
            Self::InstructionBudget => "instruction budget exhausted",
            Self::TimeLimit => "time limit exceeded",
            Self::StackOverflow => "stack overflow",
            Self::Memory => "memory exhausted",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// A fault raised while a handler or callback was running.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct ExecutionFault {
    pub kind: FaultKind,
    pub message: String,
}

impl ExecutionFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Internal, message)
    }

    pub fn scope(&self) -> FaultScope {
        match self.kind {
            FaultKind::Memory | FaultKind::Internal => FaultScope::Session,
            FaultKind::Script
            | FaultKind::InstructionBudget
            | FaultKind::TimeLimit
            | FaultKind::StackOverflow => FaultScope::Command,
        }
    }
}

// ── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("session {0} is terminated")]
    SessionTerminated(SessionId),

    #[error("session {0} is faulted")]
    SessionFaulted(SessionId),

    #[error("too many open commands ({open}/{limit})")]
    Backpressure { open: usize, limit: usize },

    #[error("command {0} is already open")]
    DuplicateCommand(CommandId),

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl Error {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
