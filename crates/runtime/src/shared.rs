//! Session state shared between the worker, the host handle, and the
//! functions exposed to the script.
//!
//! Locks in here are only ever held for table updates; none is held while
//! script code runs.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    mlua::{Function, Lua, RegistryKey},
    scriptbox_common::{CommandId, HookKind, OperationId, ResourceContext, SessionId},
    scriptbox_resources::ResourceSet,
    serde::Serialize,
    serde_json::Value,
    tokio::{runtime::Handle, sync::mpsc::WeakUnboundedSender, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::{
    binder::ApiSurface,
    completion::{CompletionTracker, DoneResult},
    continuation::ContinuationManager,
    diagnostics::{Diagnostic, DiagnosticLog},
    error::SchemaError,
    registry::{Assignment, HandlerRegistry},
    session::SessionMsg,
};

/// Message raised into the script when a context is used out of turn.
pub(crate) const INACTIVE_CONTEXT: &str = "context is no longer active";

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Loading,
    Ready,
    Faulted,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Faulted => "faulted",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Which invocation a context belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scope {
    /// The top-level chunk and callbacks of operations it started.
    Init,
    /// One dispatch of a command. `seq` tells re-dispatches of an id apart.
    Command { id: CommandId, seq: u64 },
}

impl Scope {
    pub(crate) fn command_id(&self) -> Option<&CommandId> {
        match self {
            Self::Init => None,
            Self::Command { id, .. } => Some(id),
        }
    }
}

pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) sandbox_id: String,
    pub(crate) surface: ApiSurface,
    resources: Arc<ResourceSet>,
    runtime: Handle,
    mailbox: WeakUnboundedSender<SessionMsg>,
    state: Mutex<SessionState>,
    tracker: Mutex<CompletionTracker>,
    continuations: Mutex<ContinuationManager>,
    callbacks: Mutex<HashMap<OperationId, RegistryKey>>,
    /// Resource calls still running for a registered operation.
    requests: Mutex<HashMap<OperationId, JoinHandle<()>>>,
    /// `msg` payloads of commands that still hold a context.
    messages: Mutex<HashMap<CommandId, Arc<Value>>>,
    registry: Mutex<HandlerRegistry<RegistryKey>>,
    diagnostics: DiagnosticLog,
    active: Mutex<Option<Scope>>,
    schema_violation: Mutex<Option<SchemaError>>,
    dispatch_seq: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionShared {
    pub(crate) fn new(
        sandbox_id: String,
        surface: ApiSurface,
        registry: HandlerRegistry<RegistryKey>,
        resources: Arc<ResourceSet>,
        runtime: Handle,
        mailbox: WeakUnboundedSender<SessionMsg>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            sandbox_id,
            surface,
            resources,
            runtime,
            mailbox,
            state: Mutex::new(SessionState::Loading),
            tracker: Mutex::new(CompletionTracker::new()),
            continuations: Mutex::new(ContinuationManager::new()),
            callbacks: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            registry: Mutex::new(registry),
            diagnostics: DiagnosticLog::new(),
            active: Mutex::new(None),
            schema_violation: Mutex::new(None),
            dispatch_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn tracker(&self) -> MutexGuard<'_, CompletionTracker> {
        lock(&self.tracker)
    }

    pub(crate) fn continuations(&self) -> MutexGuard<'_, ContinuationManager> {
        lock(&self.continuations)
    }

    pub(crate) fn callbacks(&self) -> MutexGuard<'_, HashMap<OperationId, RegistryKey>> {
        lock(&self.callbacks)
    }

    pub(crate) fn remember_message(&self, id: CommandId, message: Value) {
        lock(&self.messages).insert(id, Arc::new(message));
    }

    pub(crate) fn forget_message(&self, id: &CommandId) {
        lock(&self.messages).remove(id);
    }

    /// The request for `op_id` has delivered its reply.
    pub(crate) fn finish_request(&self, op_id: OperationId) {
        lock(&self.requests).remove(&op_id);
    }

    /// Forget the operations of a force-retired command, releasing their
    /// callbacks and stopping their requests. Returns how many were dropped.
    pub(crate) fn drop_operations(&self, command: &CommandId) -> usize {
        let dropped = self.continuations().retire_command(command);
        if dropped.is_empty() {
            return 0;
        }
        {
            let mut callbacks = self.callbacks();
            for op_id in &dropped {
                callbacks.remove(op_id);
            }
        }
        let mut requests = lock(&self.requests);
        for op_id in &dropped {
            if let Some(request) = requests.remove(op_id) {
                request.abort();
            }
        }
        dropped.len()
    }

    /// Forget every pending operation and stop every tracked request.
    pub(crate) fn drop_all_operations(&self) -> usize {
        let dropped = self.continuations().drain().len();
        self.callbacks().clear();
        for (_, request) in lock(&self.requests).drain() {
            request.abort();
        }
        lock(&self.messages).clear();
        dropped
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, HandlerRegistry<RegistryKey>> {
        lock(&self.registry)
    }

    pub(crate) fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub(crate) fn record(&self, diagnostic: Diagnostic) {
        self.diagnostics.record(&self.id.to_string(), diagnostic);
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.dispatch_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn mailbox(&self) -> WeakUnboundedSender<SessionMsg> {
        self.mailbox.clone()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn set_active(&self, scope: Option<Scope>) {
        *lock(&self.active) = scope;
    }

    pub(crate) fn take_schema_violation(&self) -> Option<SchemaError> {
        lock(&self.schema_violation).take()
    }

    fn violate_schema(&self, error: SchemaError) {
        let mut slot = lock(&self.schema_violation);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    // ── Intrinsics ──────────────────────────────────────────────────────────

    /// Refuse contexts that do not belong to the running invocation.
    ///
    /// The initialization context works from any invocation; a command
    /// context only from invocations of that same dispatch.
    pub(crate) fn ensure_active(&self, scope: &Scope) -> mlua::Result<()> {
        let active = lock(&self.active);
        let allowed = match (scope, active.as_ref()) {
            (_, None) => false,
            (Scope::Init, Some(_)) => true,
            (Scope::Command { .. }, Some(current)) => current == scope,
        };
        if allowed {
            Ok(())
        } else {
            Err(mlua::Error::runtime(INACTIVE_CONTEXT))
        }
    }

    pub(crate) fn mark_done(&self, scope: &Scope) -> mlua::Result<()> {
        let Some(id) = scope.command_id() else {
            self.record(Diagnostic::DoneOutsideCommand);
            return Err(mlua::Error::runtime("done() called outside of a command"));
        };
        let result = self.tracker().mark_done(id);
        match result {
            DoneResult::Retired => {
                debug!(session_id = %self.id, command_id = %id, "command done");
            },
            DoneResult::AlreadyDone => self.record(Diagnostic::DoubleCompletion {
                command_id: id.clone(),
            }),
            DoneResult::Unknown => {
                warn!(session_id = %self.id, command_id = %id, "done() for untracked command");
            },
        }
        Ok(())
    }

    /// Start a resource request, registering a continuation when the script
    /// passed a callback.
    pub(crate) fn start_operation(
        &self,
        lua: &Lua,
        scope: &Scope,
        request: String,
        payload: Value,
        callback: Option<Function>,
    ) -> mlua::Result<()> {
        let command = scope.command_id().cloned();
        let op_id = match callback {
            Some(callback) => {
                let key = lua.create_registry_value(callback)?;
                let op_id = self.continuations().register(command.clone(), &request);
                if let Some(id) = &command {
                    self.tracker().add_pending(id);
                }
                self.callbacks().insert(op_id, key);
                Some(op_id)
            },
            None => None,
        };
        debug!(
            session_id = %self.id,
            command_id = command.as_ref().map(CommandId::as_str),
            op_id = op_id.map(OperationId::get),
            request = %request,
            "operation requested"
        );
        self.spawn_request(op_id, command, request, payload);
        Ok(())
    }

    fn spawn_request(
        &self,
        op_id: Option<OperationId>,
        command: Option<CommandId>,
        request: String,
        payload: Value,
    ) {
        let resources = Arc::clone(&self.resources);
        let mailbox = self.mailbox.clone();
        let message = command
            .as_ref()
            .and_then(|id| lock(&self.messages).get(id).cloned());
        let ctx = ResourceContext {
            session_id: self.id,
            sandbox_id: self.sandbox_id.clone(),
            command_id: command,
            message,
        };
        let request = self.runtime.spawn(async move {
            let reply = resources.dispatch(&ctx, &request, payload).await;
            let Some(op_id) = op_id else {
                return;
            };
            let delivered = mailbox
                .upgrade()
                .is_some_and(|tx| tx.send(SessionMsg::OperationComplete { op_id, reply }).is_ok());
            if !delivered {
                debug!(
                    session_id = %ctx.session_id,
                    op_id = %op_id,
                    "session gone, completion discarded"
                );
            }
        });
        if let Some(op_id) = op_id {
            lock(&self.requests).insert(op_id, request);
        }
    }

    pub(crate) fn assign_hook(&self, lua: &Lua, kind: HookKind, value: mlua::Value) -> mlua::Result<()> {
        let handler = match value {
            mlua::Value::Nil => None,
            mlua::Value::Function(function) => Some(lua.create_registry_value(function)?),
            other => {
                let type_name = other.type_name();
                if !self.registry().is_sealed() {
                    self.violate_schema(SchemaError::InvalidHook {
                        name: kind.slot_name().to_string(),
                        type_name: type_name.to_string(),
                    });
                }
                return Err(mlua::Error::runtime(format!(
                    "hook `{kind}` must be a function, got {type_name}"
                )));
            },
        };
        let (assignment, sealed) = {
            let mut registry = self.registry();
            let sealed = registry.is_sealed();
            (registry.register(kind, handler), sealed)
        };
        match assignment {
            Assignment::Rejected => self.record(Diagnostic::LateHookRejected { hook: kind }),
            Assignment::Installed { .. } | Assignment::Cleared { .. } if sealed => {
                info!(session_id = %self.id, hook = %kind, "hook reassigned after initialization");
            },
            Assignment::Installed { .. } | Assignment::Cleared { .. } => {},
        }
        Ok(())
    }

    pub(crate) fn reject_unknown_hook(&self, name: &str) -> mlua::Result<()> {
        if !self.registry().is_sealed() {
            self.violate_schema(SchemaError::UnknownHook {
                name: name.to_string(),
            });
        }
        Err(mlua::Error::runtime(format!("unknown hook `{name}`")))
    }
}
