//! Typed map from hook kind to the script's handler.

use std::collections::HashMap;

use {
    scriptbox_common::HookKind,
    scriptbox_config::LateHookPolicy,
    tracing::{debug, info},
};

/// What a hook assignment did.
#[derive(Debug)]
pub enum Assignment<H> {
    /// The handler is now installed; `replaced` is the previous one, if any.
    Installed { replaced: Option<H> },
    /// The slot was emptied.
    Cleared { previous: Option<H> },
    /// Sealed registry under [`LateHookPolicy::Reject`]; nothing changed.
    Rejected,
}

/// Hook handlers of one session.
///
/// Filled during the script's initialization pass and sealed afterwards.
/// Generic over the handler reference so it can be exercised without a
/// scripting engine.
#[derive(Debug)]
pub struct HandlerRegistry<H> {
    handlers: HashMap<HookKind, H>,
    sealed: bool,
    policy: LateHookPolicy,
}

impl<H> HandlerRegistry<H> {
    pub fn new(policy: LateHookPolicy) -> Self {
        Self {
            handlers: HashMap::new(),
            sealed: false,
            policy,
        }
    }

    pub fn policy(&self) -> LateHookPolicy {
        self.policy
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// End the initialization pass.
    pub fn seal(&mut self) {
        self.sealed = true;
        info!(hooks = ?self.installed(), "hook registry sealed");
    }

    /// Assign (`Some`) or clear (`None`) a hook. Last assignment wins.
    pub fn register(&mut self, kind: HookKind, handler: Option<H>) -> Assignment<H> {
        if self.sealed && self.policy == LateHookPolicy::Reject {
            return Assignment::Rejected;
        }
        let late = self.sealed;
        match handler {
            Some(handler) => {
                let replaced = self.handlers.insert(kind, handler);
                debug!(hook = %kind, late, replaced = replaced.is_some(), "hook installed");
                Assignment::Installed { replaced }
            },
            None => {
                let previous = self.handlers.remove(&kind);
                debug!(hook = %kind, late, "hook cleared");
                Assignment::Cleared { previous }
            },
        }
    }

    pub fn lookup(&self, kind: HookKind) -> Option<&H> {
        self.handlers.get(&kind)
    }

    /// Installed hook kinds in schema order.
    pub fn installed(&self) -> Vec<HookKind> {
        HookKind::ALL
            .iter()
            .copied()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}
