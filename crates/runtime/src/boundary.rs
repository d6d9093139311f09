//! The isolation context a script runs in.
//!
//! A [`Boundary`] owns a restricted Lua state: only pure standard libraries
//! are opened, every loader and the garbage-collector control are removed,
//! and a memory cap is installed. Each invocation runs under an instruction
//! budget and a wall-clock deadline enforced from a VM hook.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use {
    mlua::{ChunkMode, Function, HookTriggers, IntoLuaMulti, Lua, LuaOptions, StdLib, VmState},
    scriptbox_config::LimitsConfig,
    tracing::debug,
};

use crate::error::{ExecutionFault, FaultKind, LoadError};

/// VM instructions between two budget checks.
const HOOK_INTERVAL: u32 = 1_000;

/// Globals removed from the base library after the state is created.
const REMOVED_GLOBALS: &[&str] = &[
    "dofile",
    "loadfile",
    "load",
    "require",
    "collectgarbage",
    "print",
];

// ── Budget ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Armed {
    remaining: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct BudgetState {
    armed: Option<Armed>,
    exceeded: Option<FaultKind>,
}

/// Instruction and time allowance of the current invocation.
#[derive(Debug, Default)]
struct Budget {
    state: Mutex<BudgetState>,
}

impl Budget {
    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, instructions: u64, time: Duration) {
        let mut state = self.lock();
        state.exceeded = None;
        state.armed = Some(Armed {
            remaining: instructions,
            deadline: Instant::now() + time,
        });
    }

    /// Stop counting and report which limit, if any, was hit.
    fn disarm(&self) -> Option<FaultKind> {
        let mut state = self.lock();
        state.armed = None;
        state.exceeded.take()
    }

    fn tick(&self) -> mlua::Result<VmState> {
        let mut state = self.lock();
        let Some(armed) = state.armed.as_mut() else {
            return Ok(VmState::Continue);
        };
        armed.remaining = armed.remaining.saturating_sub(u64::from(HOOK_INTERVAL));
        let exceeded = if armed.remaining == 0 {
            Some(FaultKind::InstructionBudget)
        } else if Instant::now() >= armed.deadline {
            Some(FaultKind::TimeLimit)
        } else {
            None
        };
        match exceeded {
            Some(kind) => {
                state.exceeded = Some(kind);
                Err(mlua::Error::runtime(kind))
            },
            None => Ok(VmState::Continue),
        }
    }
}

// ── Fault classification ────────────────────────────────────────────────────

/// Map an engine error to a fault, looking through callback wrappers.
pub(crate) fn classify(error: &mlua::Error) -> ExecutionFault {
    ExecutionFault::new(fault_kind(error), error.to_string())
}

fn fault_kind(error: &mlua::Error) -> FaultKind {
    match error {
        mlua::Error::MemoryError(_) => FaultKind::Memory,
        mlua::Error::RuntimeError(message) if message.contains("stack overflow") => {
            FaultKind::StackOverflow
        },
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            fault_kind(cause)
        },
        mlua::Error::StackError | mlua::Error::CallbackDestructed => FaultKind::Internal,
        _ => FaultKind::Script,
    }
}

// ── Boundary ────────────────────────────────────────────────────────────────

pub struct Boundary {
    lua: Lua,
    budget: Arc<Budget>,
    instruction_budget: u64,
    invocation_time: Duration,
    script_name: String,
}

impl Boundary {
    /// Create a restricted state with the given limits.
    pub fn new(script_name: &str, limits: &LimitsConfig) -> Result<Self, LoadError> {
        let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
        let lua = Lua::new_with(libs, LuaOptions::default())
            .map_err(|e| LoadError::boundary(e.to_string()))?;

        let globals = lua.globals();
        for name in REMOVED_GLOBALS {
            globals
                .raw_set(*name, mlua::Value::Nil)
                .map_err(|e| LoadError::boundary(e.to_string()))?;
        }
        // string.dump produces loadable bytecode.
        if let Ok(string) = globals.raw_get::<mlua::Table>("string") {
            string
                .raw_set("dump", mlua::Value::Nil)
                .map_err(|e| LoadError::boundary(e.to_string()))?;
        }

        lua.set_memory_limit(limits.memory_bytes)
            .map_err(|e| LoadError::boundary(e.to_string()))?;

        let budget = Arc::new(Budget::default());
        let hook_budget = Arc::clone(&budget);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_lua, _debug| hook_budget.tick(),
        );

        debug!(
            script = script_name,
            memory_bytes = limits.memory_bytes,
            instruction_budget = limits.instruction_budget,
            "isolation context created"
        );

        Ok(Self {
            lua,
            budget,
            instruction_budget: limits.instruction_budget,
            invocation_time: limits.invocation_time(),
            script_name: script_name.to_string(),
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Compile and run the script's top-level chunk once.
    pub fn load(&self, source: &str) -> Result<(), LoadError> {
        let chunk = self
            .lua
            .load(source)
            .set_name(format!("={}", self.script_name))
            .set_mode(ChunkMode::Text);

        self.budget.arm(self.instruction_budget, self.invocation_time);
        let result = chunk.exec();
        let exceeded = self.budget.disarm();

        match result {
            Ok(()) => Ok(()),
            Err(mlua::Error::SyntaxError { message, .. }) => Err(LoadError::Syntax {
                script: self.script_name.clone(),
                message,
            }),
            Err(e) => {
                let mut fault = classify(&e);
                if let Some(kind) = exceeded {
                    fault.kind = kind;
                }
                Err(LoadError::Initialization {
                    script: self.script_name.clone(),
                    message: fault.to_string(),
                })
            },
        }
    }

    /// Run a handler or callback to completion under the invocation limits.
    pub fn invoke(&self, function: &Function, args: impl IntoLuaMulti) -> Result<(), ExecutionFault> {
        self.budget.arm(self.instruction_budget, self.invocation_time);
        let result = function.call::<()>(args);
        let exceeded = self.budget.disarm();

        result.map_err(|e| {
            let mut fault = classify(&e);
            // A limit error caught and rethrown by the script still counts.
            if let Some(kind) = exceeded
                && fault.kind != FaultKind::Memory
            {
                fault.kind = kind;
            }
            fault
        })
    }

    /// Memory currently held by the script state.
    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }
}
