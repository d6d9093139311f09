//! Per-command completion records.
//!
//! A command is open from dispatch until it is retired, either by the script
//! calling `done()` or by the host forcing it (abandon, timeout, teardown).
//! The outcome is handed out once, at retirement. A command retired by
//! `done()` keeps its record until its outstanding operations have called
//! back, so a later `done()` from one of those callbacks is still recognised
//! as a repeat. Forcing a command drops its outstanding operations.

use std::{collections::HashMap, fmt, time::Instant};

use {scriptbox_common::CommandId, serde::Serialize};

use crate::error::ExecutionFault;

/// Why the host retired a command without the script's consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    Host,
    Timeout,
    SessionTerminated,
    SessionFaulted,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Host => "abandoned by host",
            Self::Timeout => "timed out",
            Self::SessionTerminated => "session terminated",
            Self::SessionFaulted => "session faulted",
        };
        f.write_str(name)
    }
}

/// Final state of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The script called `done()`.
    Completed,
    Failed { fault: ExecutionFault },
    NoHandler,
    Abandoned { reason: AbandonReason },
}

impl CommandOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Result of a script-initiated [`CompletionTracker::mark_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneResult {
    Retired,
    /// Already retired; nothing changed.
    AlreadyDone,
    Unknown,
}

#[derive(Debug)]
struct CompletionRecord {
    dispatched_at: Instant,
    outstanding: usize,
    outcome: Option<CommandOutcome>,
    reported: bool,
}

impl CompletionRecord {
    fn is_done(&self) -> bool {
        self.outcome.is_some()
    }
}

#[derive(Debug, Default)]
pub struct CompletionTracker {
    records: HashMap<CommandId, CompletionRecord>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a command. Returns `false` if the id is already known.
    pub fn open(&mut self, id: CommandId) -> bool {
        if self.records.contains_key(&id) {
            return false;
        }
        self.records.insert(id, CompletionRecord {
            dispatched_at: Instant::now(),
            outstanding: 0,
            outcome: None,
            reported: false,
        });
        true
    }

    /// Forget a command that was opened but never delivered.
    pub fn cancel(&mut self, id: &CommandId) {
        self.records.remove(id);
    }

    pub fn mark_done(&mut self, id: &CommandId) -> DoneResult {
        match self.records.get_mut(id) {
            None => DoneResult::Unknown,
            Some(record) if record.is_done() => DoneResult::AlreadyDone,
            Some(record) => {
                record.outcome = Some(CommandOutcome::Completed);
                DoneResult::Retired
            },
        }
    }

    /// Retire an open command with a host-chosen outcome, dropping its
    /// outstanding operations.
    ///
    /// Returns `false` when the command is unknown or already retired.
    pub fn force_retire(&mut self, id: &CommandId, outcome: CommandOutcome) -> bool {
        match self.records.get_mut(id) {
            Some(record) if !record.is_done() => {
                record.outcome = Some(outcome);
                record.outstanding = 0;
                true
            },
            _ => false,
        }
    }

    /// Count an operation against a command. Completed commands still accept
    /// operations started from their callbacks.
    pub fn add_pending(&mut self, id: &CommandId) -> bool {
        match self.records.get_mut(id) {
            Some(record) if record.outcome.as_ref().is_none_or(CommandOutcome::is_completed) => {
                record.outstanding += 1;
                true
            },
            _ => false,
        }
    }

    pub fn resolve_pending(&mut self, id: &CommandId) -> bool {
        match self.records.get_mut(id) {
            Some(record) if record.outstanding > 0 => {
                record.outstanding -= 1;
                true
            },
            _ => false,
        }
    }

    /// True while the command is open.
    pub fn is_pending(&self, id: &CommandId) -> bool {
        self.records.get(id).is_some_and(|r| !r.is_done())
    }

    pub fn outstanding(&self, id: &CommandId) -> usize {
        self.records.get(id).map_or(0, |r| r.outstanding)
    }

    pub fn open_count(&self) -> usize {
        self.records.values().filter(|r| !r.is_done()).count()
    }

    /// Ids of open commands, oldest first.
    pub fn open_ids(&self) -> Vec<CommandId> {
        let mut open: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| !r.is_done())
            .map(|(id, r)| (r.dispatched_at, id.clone()))
            .collect();
        open.sort();
        open.into_iter().map(|(_, id)| id).collect()
    }

    /// Hand out the outcome of a retired command, once.
    ///
    /// Open commands and already reported ones yield `None`.
    pub fn take_outcome(&mut self, id: &CommandId) -> Option<CommandOutcome> {
        let record = self.records.get_mut(id)?;
        if record.reported {
            return None;
        }
        let outcome = record.outcome.clone()?;
        record.reported = true;
        Some(outcome)
    }

    /// Drop the record of a reported command once nothing is outstanding.
    ///
    /// Returns `true` when no record is left for `id`.
    pub fn release(&mut self, id: &CommandId) -> bool {
        match self.records.get(id) {
            None => true,
            Some(record) if record.reported && record.outstanding == 0 => {
                self.records.remove(id);
                true
            },
            Some(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
