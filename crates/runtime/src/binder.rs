//! The script-visible API surface.
//!
//! Scripts see a context table per scope: the global `api` during
//! initialization, and one table per dispatched command that is passed as the
//! first argument to the handler and to every callback it registers. Reads
//! resolve intrinsics, writes to hook slots go to the handler registry, and
//! everything else is the script's own scratch space. The metatable is locked
//! so the proxy cannot be swapped out from inside the script.

use std::sync::Arc;

use {
    mlua::{Function, Lua, LuaSerdeExt, MultiValue, Table, Value as LuaValue},
    scriptbox_common::HookKind,
    scriptbox_resources::LogLevel,
    serde_json::{Map, Value},
};

use crate::{
    error::SchemaError,
    shared::{Scope, SessionShared},
};

/// Version of the intrinsic and hook name set.
pub const SCHEMA_VERSION: u32 = 1;

// ── Intrinsic ───────────────────────────────────────────────────────────────

/// Host operations available to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    LogDebug,
    LogInfo,
    LogWarning,
    LogError,
    LogCritical,
    /// `request(name, payload, callback?)`, the generic resource call.
    Request,
    Done,
    SandboxId,
}

impl Intrinsic {
    pub const ALL: &'static [Intrinsic] = &[
        Self::LogDebug,
        Self::LogInfo,
        Self::LogWarning,
        Self::LogError,
        Self::LogCritical,
        Self::Request,
        Self::Done,
        Self::SandboxId,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::LogDebug => "log_debug",
            Self::LogInfo => "log_info",
            Self::LogWarning => "log_warning",
            Self::LogError => "log_error",
            Self::LogCritical => "log_critical",
            Self::Request => "request",
            Self::Done => "done",
            Self::SandboxId => "sandbox_id",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|i| i.name() == name)
    }

    /// The log level for the `log_*` shorthands.
    pub fn log_level(self) -> Option<LogLevel> {
        match self {
            Self::LogDebug => Some(LogLevel::Debug),
            Self::LogInfo => Some(LogLevel::Info),
            Self::LogWarning => Some(LogLevel::Warning),
            Self::LogError => Some(LogLevel::Error),
            Self::LogCritical => Some(LogLevel::Critical),
            Self::Request | Self::Done | Self::SandboxId => None,
        }
    }
}

// ── Slot ────────────────────────────────────────────────────────────────────

/// What a string key on a context table refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Intrinsic(Intrinsic),
    Hook(HookKind),
    /// Looks like a hook (`on_*`) but is not in the schema.
    UnknownHook,
    Scratch,
}

impl Slot {
    pub fn classify(name: &str) -> Self {
        if let Some(intrinsic) = Intrinsic::from_name(name) {
            Self::Intrinsic(intrinsic)
        } else if let Some(hook) = HookKind::from_slot_name(name) {
            Self::Hook(hook)
        } else if HookKind::is_hook_like(name) {
            Self::UnknownHook
        } else {
            Self::Scratch
        }
    }
}

// ── ApiSurface ──────────────────────────────────────────────────────────────

/// The validated set of intrinsics a session exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSurface {
    intrinsics: Vec<Intrinsic>,
}

impl Default for ApiSurface {
    fn default() -> Self {
        Self {
            intrinsics: Intrinsic::ALL.to_vec(),
        }
    }
}

impl ApiSurface {
    /// Build from configured names; `None` exposes every intrinsic.
    pub fn from_names(names: Option<&[String]>) -> Result<Self, SchemaError> {
        let Some(names) = names else {
            return Ok(Self::default());
        };
        let mut intrinsics = Vec::with_capacity(names.len());
        for name in names {
            let intrinsic =
                Intrinsic::from_name(name).ok_or_else(|| SchemaError::UnknownIntrinsic {
                    name: name.clone(),
                    version: SCHEMA_VERSION,
                })?;
            if !intrinsics.contains(&intrinsic) {
                intrinsics.push(intrinsic);
            }
        }
        if !intrinsics.contains(&Intrinsic::Done) {
            return Err(SchemaError::MissingIntrinsic {
                name: Intrinsic::Done.name(),
            });
        }
        Ok(Self { intrinsics })
    }

    pub fn intrinsics(&self) -> &[Intrinsic] {
        &self.intrinsics
    }

    pub fn exposes(&self, intrinsic: Intrinsic) -> bool {
        self.intrinsics.contains(&intrinsic)
    }
}

// ── Binding ─────────────────────────────────────────────────────────────────

/// Build the context table for one scope.
pub(crate) fn bind_context(lua: &Lua, shared: &Arc<SessionShared>, scope: Scope) -> mlua::Result<Table> {
    let index = lua.create_table()?;
    for &intrinsic in shared.surface.intrinsics() {
        index.raw_set(
            intrinsic.name(),
            intrinsic_function(lua, shared, scope.clone(), intrinsic)?,
        )?;
    }

    let assign = {
        let shared = Arc::clone(shared);
        lua.create_function(
            move |lua, (table, key, value): (Table, LuaValue, LuaValue)| {
                assign_slot(lua, &shared, &table, key, value)
            },
        )?
    };

    let meta = lua.create_table()?;
    meta.raw_set("__index", index)?;
    meta.raw_set("__newindex", assign)?;
    meta.raw_set("__metatable", "locked")?;

    let ctx = lua.create_table()?;
    ctx.set_metatable(Some(meta));
    Ok(ctx)
}

fn assign_slot(
    lua: &Lua,
    shared: &SessionShared,
    table: &Table,
    key: LuaValue,
    value: LuaValue,
) -> mlua::Result<()> {
    let name = match &key {
        LuaValue::String(name) => name.to_str()?.to_string(),
        _ => return table.raw_set(key, value),
    };
    match Slot::classify(&name) {
        Slot::Intrinsic(_) => Err(mlua::Error::runtime(format!(
            "`{name}` is an intrinsic and cannot be assigned"
        ))),
        Slot::Hook(kind) => shared.assign_hook(lua, kind, value),
        Slot::UnknownHook => shared.reject_unknown_hook(&name),
        Slot::Scratch => table.raw_set(key, value),
    }
}

fn intrinsic_function(
    lua: &Lua,
    shared: &Arc<SessionShared>,
    scope: Scope,
    intrinsic: Intrinsic,
) -> mlua::Result<Function> {
    let shared = Arc::clone(shared);
    match intrinsic {
        Intrinsic::Done => lua.create_function(move |_, _: MultiValue| {
            shared.ensure_active(&scope)?;
            shared.mark_done(&scope)
        }),
        Intrinsic::SandboxId => lua.create_function(move |_, _: MultiValue| {
            shared.ensure_active(&scope)?;
            Ok(shared.sandbox_id.clone())
        }),
        Intrinsic::Request => lua.create_function(move |lua, args: MultiValue| {
            shared.ensure_active(&scope)?;
            let mut args = arguments(args);
            let name = match args.next() {
                Some(LuaValue::String(name)) => name.to_str()?.to_string(),
                other => {
                    return Err(mlua::Error::runtime(format!(
                        "request name must be a string, got {}",
                        type_name(other.as_ref())
                    )));
                },
            };
            let payload = match args.next() {
                None | Some(LuaValue::Nil) => Value::Object(Map::new()),
                Some(value) => lua.from_value::<Value>(value).map_err(|e| {
                    mlua::Error::runtime(format!("request payload cannot be converted: {e}"))
                })?,
            };
            let callback = callback(args.next())?;
            shared.start_operation(lua, &scope, name, payload, callback)
        }),
        Intrinsic::LogDebug
        | Intrinsic::LogInfo
        | Intrinsic::LogWarning
        | Intrinsic::LogError
        | Intrinsic::LogCritical => {
            let level = intrinsic.log_level().unwrap_or(LogLevel::Info);
            let request = format!("log.{level}");
            lua.create_function(move |lua, args: MultiValue| {
                shared.ensure_active(&scope)?;
                let mut args = arguments(args);
                let message = message(args.next())?;
                let callback = callback(args.next())?;
                shared.start_operation(
                    lua,
                    &scope,
                    request.clone(),
                    serde_json::json!({ "msg": message }),
                    callback,
                )
            })
        },
    }
}

/// Arguments without the receiver, so `ctx:log_info(m)` and
/// `ctx.log_info(m)` both work.
fn arguments(args: MultiValue) -> std::vec::IntoIter<LuaValue> {
    let mut args: Vec<LuaValue> = args.into_iter().collect();
    if matches!(args.first(), Some(LuaValue::Table(_))) {
        args.remove(0);
    }
    args.into_iter()
}

fn type_name(value: Option<&LuaValue>) -> &'static str {
    value.map_or("no value", LuaValue::type_name)
}

fn message(value: Option<LuaValue>) -> mlua::Result<String> {
    match value {
        Some(LuaValue::String(s)) => Ok(s.to_str()?.to_string()),
        Some(LuaValue::Integer(i)) => Ok(i.to_string()),
        Some(LuaValue::Number(n)) => Ok(n.to_string()),
        Some(LuaValue::Boolean(b)) => Ok(b.to_string()),
        other => Err(mlua::Error::runtime(format!(
            "log message must be a string, got {}",
            type_name(other.as_ref())
        ))),
    }
}

fn callback(value: Option<LuaValue>) -> mlua::Result<Option<Function>> {
    match value {
        None | Some(LuaValue::Nil) => Ok(None),
        Some(LuaValue::Function(f)) => Ok(Some(f)),
        Some(other) => Err(mlua::Error::runtime(format!(
            "callback must be a function, got {}",
            other.type_name()
        ))),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_surface_exposes_schema_v1() {
        let surface = ApiSurface::from_names(None).unwrap();
        assert_eq!(surface.intrinsics().len(), 8);
        assert!(surface.exposes(Intrinsic::SandboxId));
    }

    #[test]
    fn configured_surface_is_checked() {
        let configured = names(&["log_info", "done", "done"]);
        let surface = ApiSurface::from_names(Some(configured.as_slice())).unwrap();
        assert_eq!(surface.intrinsics(), &[Intrinsic::LogInfo, Intrinsic::Done]);
        assert!(!surface.exposes(Intrinsic::Request));

        assert_eq!(
            ApiSurface::from_names(Some(names(&["log_info", "http_get", "done"]).as_slice())),
            Err(SchemaError::UnknownIntrinsic {
                name: "http_get".into(),
                version: SCHEMA_VERSION,
            })
        );
        assert_eq!(
            ApiSurface::from_names(Some(names(&["log_info"]).as_slice())),
            Err(SchemaError::MissingIntrinsic { name: "done" })
        );
    }

    #[test]
    fn slots_are_classified() {
        assert_eq!(Slot::classify("done"), Slot::Intrinsic(Intrinsic::Done));
        assert_eq!(
            Slot::classify("on_inbound_event"),
            Slot::Hook(HookKind::InboundEvent)
        );
        assert_eq!(Slot::classify("on_outbound_message"), Slot::UnknownHook);
        assert_eq!(Slot::classify("counter"), Slot::Scratch);
    }

    #[test]
    fn log_intrinsics_map_to_levels() {
        assert_eq!(Intrinsic::LogWarning.log_level(), Some(LogLevel::Warning));
        assert_eq!(Intrinsic::Done.log_level(), None);
        for &intrinsic in Intrinsic::ALL {
            assert_eq!(Intrinsic::from_name(intrinsic.name()), Some(intrinsic));
        }
    }
}
