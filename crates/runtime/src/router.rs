//! Handler selection for inbound commands.

use scriptbox_common::{CommandKind, HookKind};

use crate::registry::HandlerRegistry;

/// Where a command goes.
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a, H> {
    /// The handler installed for `hook`.
    Handler { hook: HookKind, handler: &'a H },
    /// Nothing installed, not even the unknown-command fallback.
    NoHandler,
}

impl<H> Route<'_, H> {
    pub fn hook(&self) -> Option<HookKind> {
        match self {
            Self::Handler { hook, .. } => Some(*hook),
            Self::NoHandler => None,
        }
    }
}

/// Pick the kind-specific handler, falling back to `on_unknown_command`.
pub fn route<H>(registry: &HandlerRegistry<H>, kind: CommandKind) -> Route<'_, H> {
    [HookKind::for_command(kind), HookKind::UnknownCommand]
        .into_iter()
        .find_map(|hook| {
            registry
                .lookup(hook)
                .map(|handler| Route::Handler { hook, handler })
        })
        .unwrap_or(Route::NoHandler)
}
