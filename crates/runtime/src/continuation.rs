//! Pending asynchronous operations.
//!
//! The manager only tracks operation identity and ownership. The script
//! callbacks themselves live with the session, keyed by [`OperationId`], so
//! this table stays independent of the scripting engine.

use std::{collections::HashMap, fmt, time::Instant};

use {
    scriptbox_common::{CommandId, OperationId, OperationIdAllocator},
    serde::Serialize,
};

/// An in-flight host operation whose reply a script is waiting for.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub id: OperationId,
    /// Owning command, or `None` for operations started during initialization.
    pub command: Option<CommandId>,
    /// Request name, e.g. `log.info`.
    pub operation: String,
    pub requested_at: Instant,
}

/// Why a completion did not lead to a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Never registered, already resolved, or dropped with an abandoned
    /// command.
    UnknownOperation,
    /// The owning command no longer has a context to re-enter with.
    CommandAbandoned,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperation => f.write_str("unknown operation"),
            Self::CommandAbandoned => f.write_str("command abandoned"),
        }
    }
}

#[derive(Debug)]
pub enum Resolution {
    /// Deliver the reply to the operation's callback.
    Resume(PendingOperation),
    Discard(DiscardReason),
}

#[derive(Debug, Default)]
pub struct ContinuationManager {
    ids: OperationIdAllocator,
    pending: HashMap<OperationId, PendingOperation>,
}

impl ContinuationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation and return its fresh id.
    pub fn register(&mut self, command: Option<CommandId>, operation: &str) -> OperationId {
        let id = self.ids.next_id();
        self.pending.insert(id, PendingOperation {
            id,
            command,
            operation: operation.to_string(),
            requested_at: Instant::now(),
        });
        id
    }

    /// Resolve an operation. Each id resolves at most once.
    pub fn resolve(&mut self, id: OperationId) -> Resolution {
        match self.pending.remove(&id) {
            Some(operation) => Resolution::Resume(operation),
            None => Resolution::Discard(DiscardReason::UnknownOperation),
        }
    }

    /// Forget every operation of an abandoned command.
    ///
    /// Returns the removed ids so the caller can release their callbacks and
    /// stop their requests. Replies that still arrive resolve as unknown.
    pub fn retire_command(&mut self, command: &CommandId) -> Vec<OperationId> {
        let mut ids: Vec<_> = self
            .pending
            .values()
            .filter(|op| op.command.as_ref() == Some(command))
            .map(|op| op.id)
            .collect();
        for id in &ids {
            self.pending.remove(id);
        }
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_for(&self, command: &CommandId) -> usize {
        self.pending
            .values()
            .filter(|op| op.command.as_ref() == Some(command))
            .count()
    }

    /// Drop everything, returning the ids that were still pending.
    pub fn drain(&mut self) -> Vec<OperationId> {
        let mut ids: Vec<_> = self.pending.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }
}
