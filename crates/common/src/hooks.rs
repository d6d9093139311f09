//! Script hook kinds.
//!
//! A hook is a named slot on the script API that the script fills with a
//! handler function during its initialization pass. The set of hook names is
//! closed and versioned together with the intrinsic operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::CommandKind;

// ── HookKind ────────────────────────────────────────────────────────────────

/// Handler slots a script can install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Fallback for commands without a kind-specific handler.
    UnknownCommand,
    InboundMessage,
    InboundEvent,
}

impl HookKind {
    /// All variants, for iteration.
    pub const ALL: &'static [HookKind] =
        &[Self::UnknownCommand, Self::InboundMessage, Self::InboundEvent];

    /// Name of the slot as seen by scripts (`api.on_inbound_message`).
    pub fn slot_name(self) -> &'static str {
        match self {
            Self::UnknownCommand => "on_unknown_command",
            Self::InboundMessage => "on_inbound_message",
            Self::InboundEvent => "on_inbound_event",
        }
    }

    pub fn from_slot_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.slot_name() == name)
    }

    /// The hook serving a command kind directly, before any fallback.
    pub fn for_command(kind: CommandKind) -> Self {
        match kind {
            CommandKind::InboundMessage => Self::InboundMessage,
            CommandKind::InboundEvent => Self::InboundEvent,
            CommandKind::Unknown => Self::UnknownCommand,
        }
    }

    /// Returns true if `name` looks like a hook slot (`on_*`), known or not.
    pub fn is_hook_like(name: &str) -> bool {
        name.starts_with("on_")
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slot_name())
    }
}
