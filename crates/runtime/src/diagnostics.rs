//! Non-fatal conditions observed while running a session.
//!
//! Every diagnostic is logged when recorded and kept in a bounded in-memory
//! log the host can inspect.

use std::{collections::VecDeque, fmt, sync::Mutex};

use {
    scriptbox_common::{CommandId, CommandKind, HookKind, OperationId},
    serde::Serialize,
    tracing::warn,
};

use crate::{continuation::DiscardReason, error::ExecutionFault};

/// Entries kept per session before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A command was dropped because no handler could take it.
    NoHandler {
        command_id: CommandId,
        command_kind: CommandKind,
    },
    /// `done()` was called for a command that was already retired.
    DoubleCompletion { command_id: CommandId },
    TimeoutAbandon {
        command_id: CommandId,
        after_ms: u64,
    },
    /// A hook was assigned after initialization and ignored.
    LateHookRejected { hook: HookKind },
    CompletionDiscarded {
        op_id: OperationId,
        reason: DiscardReason,
    },
    /// `done()` was called on the initialization context.
    DoneOutsideCommand,
    ExecutionFault {
        command_id: Option<CommandId>,
        fault: ExecutionFault,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHandler {
                command_id,
                command_kind,
            } => write!(f, "no handler for {command_kind} command {command_id}"),
            Self::DoubleCompletion { command_id } => {
                write!(f, "done() called again for command {command_id}")
            },
            Self::TimeoutAbandon {
                command_id,
                after_ms,
            } => write!(f, "command {command_id} abandoned after {after_ms}ms"),
            Self::LateHookRejected { hook } => {
                write!(f, "late assignment of {hook} rejected")
            },
            Self::CompletionDiscarded { op_id, reason } => {
                write!(f, "completion of {op_id} discarded: {reason}")
            },
            Self::DoneOutsideCommand => f.write_str("done() called outside of a command"),
            Self::ExecutionFault {
                command_id: Some(command_id),
                fault,
            } => write!(f, "command {command_id} faulted: {fault}"),
            Self::ExecutionFault {
                command_id: None,
                fault,
            } => write!(f, "initialization callback faulted: {fault}"),
        }
    }
}

/// Bounded, thread-safe diagnostics log.
#[derive(Debug)]
pub struct DiagnosticLog {
    entries: Mutex<VecDeque<Diagnostic>>,
    capacity: usize,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, session: &str, diagnostic: Diagnostic) {
        warn!(session_id = session, diagnostic = %diagnostic, "session diagnostic");
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(diagnostic);
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Diagnostic) -> bool) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|d| predicate(d))
            .count()
    }
}
