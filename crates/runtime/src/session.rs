//! Sessions: one loaded script and the worker that runs it.
//!
//! Each session owns a worker on tokio's blocking pool. The worker owns the
//! isolation context and consumes a single mailbox, so every handler
//! invocation and callback re-entry of a session runs one at a time, in the
//! order the mailbox delivers them. Resource calls run as ordinary tokio
//! tasks and report back through a weak mailbox sender; once the session is
//! gone their replies have nowhere to go and are dropped.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    mlua::{Function, IntoLuaMulti, LuaSerdeExt, RegistryKey, SerializeOptions, Table},
    scriptbox_common::{Command, CommandId, HookKind, OperationId, Reply, SessionId},
    scriptbox_config::{LateHookPolicy, LimitsConfig, ScriptboxConfig, Severity},
    scriptbox_resources::ResourceSet,
    tokio::{
        runtime::Handle,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            oneshot,
        },
        task::JoinHandle,
    },
    tracing::{debug, error, info},
};

use crate::{
    binder::{ApiSurface, bind_context},
    boundary::{Boundary, classify},
    completion::{AbandonReason, CommandOutcome},
    continuation::{DiscardReason, Resolution},
    diagnostics::Diagnostic,
    error::{Error, ExecutionFault, FaultScope, LoadError, Result},
    registry::HandlerRegistry,
    router::{Route, route},
    shared::{Scope, SessionShared, SessionState},
};

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Namespace for resource state such as key-value entries.
    pub sandbox_id: String,
    /// Chunk name used in script error messages.
    pub script_name: String,
    pub late_hook_policy: LateHookPolicy,
    pub max_open_commands: usize,
    pub command_timeout: Option<Duration>,
    pub limits: LimitsConfig,
    /// Intrinsics to expose; `None` exposes all of them.
    pub intrinsics: Option<Vec<String>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sandbox_id: SessionId::new().to_string(),
            script_name: "app".into(),
            late_hook_policy: LateHookPolicy::default(),
            max_open_commands: 64,
            command_timeout: None,
            limits: LimitsConfig::default(),
            intrinsics: None,
        }
    }
}

impl SessionOptions {
    /// Options from a loaded configuration. Fails on validation errors.
    pub fn from_config(config: &ScriptboxConfig) -> Result<Self> {
        let report = scriptbox_config::validate(config);
        if report.has_errors() {
            let message = report
                .diagnostics
                .iter()
                .filter(|d| d.severity == Severity::Error)
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::config(message));
        }
        let defaults = Self::default();
        Ok(Self {
            sandbox_id: config.sandbox.id.clone().unwrap_or(defaults.sandbox_id),
            script_name: config.sandbox.script_name.clone(),
            late_hook_policy: config.sandbox.late_hook_policy,
            max_open_commands: config.sandbox.max_open_commands,
            command_timeout: config.sandbox.command_timeout(),
            limits: config.limits.clone(),
            intrinsics: config.api.intrinsics.clone(),
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────────────

pub(crate) enum SessionMsg {
    Dispatch {
        command: Command,
        seq: u64,
        waiter: oneshot::Sender<CommandOutcome>,
    },
    OperationComplete {
        op_id: OperationId,
        reply: Reply,
    },
    Abandon {
        command_id: CommandId,
        reason: AbandonReason,
        /// Only abandon this dispatch of the id; `None` matches any.
        seq: Option<u64>,
        ack: Option<oneshot::Sender<bool>>,
    },
    Terminate {
        ack: oneshot::Sender<()>,
    },
}

// ── Session ─────────────────────────────────────────────────────────────────

/// Host-side handle to a loaded script.
///
/// Cheap to clone. The session shuts down when it is terminated or when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    mailbox: UnboundedSender<SessionMsg>,
    max_open_commands: usize,
}

impl Session {
    /// Load a script and run its initialization pass.
    ///
    /// Returns only once the script's top level has run and its hooks are
    /// sealed. No session is returned on failure.
    pub async fn load(
        source: impl Into<String>,
        options: SessionOptions,
        resources: Arc<ResourceSet>,
    ) -> Result<Self> {
        let surface = ApiSurface::from_names(options.intrinsics.as_deref())?;
        let runtime =
            Handle::try_current().map_err(|e| LoadError::boundary(e.to_string()))?;
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::new(
            options.sandbox_id.clone(),
            surface,
            HandlerRegistry::new(options.late_hook_policy),
            resources,
            runtime.clone(),
            mailbox.downgrade(),
        ));

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker_shared = Arc::clone(&shared);
        let max_open_commands = options.max_open_commands;
        let source = source.into();
        runtime.spawn_blocking(move || {
            Worker::run(worker_shared, &options, &source, inbox, ready_tx);
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                shared,
                mailbox,
                max_open_commands,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LoadError::boundary("session worker exited during load").into()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn sandbox_id(&self) -> &str {
        &self.shared.sandbox_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn installed_hooks(&self) -> Vec<HookKind> {
        self.shared.registry().installed()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.shared.diagnostics().snapshot()
    }

    /// True while the command has not been retired.
    pub fn is_pending(&self, id: &CommandId) -> bool {
        self.shared.tracker().is_pending(id)
    }

    pub fn open_commands(&self) -> usize {
        self.shared.tracker().open_count()
    }

    /// Queue a command for its handler.
    pub fn dispatch(&self, command: Command) -> Result<CommandReceipt> {
        self.ensure_ready()?;
        let id = command.id.clone();
        {
            let mut tracker = self.shared.tracker();
            let open = tracker.open_count();
            if open >= self.max_open_commands {
                return Err(Error::Backpressure {
                    open,
                    limit: self.max_open_commands,
                });
            }
            if !tracker.open(id.clone()) {
                return Err(Error::DuplicateCommand(id));
            }
        }

        let seq = self.shared.next_seq();
        let (waiter, outcome) = oneshot::channel();
        if self
            .mailbox
            .send(SessionMsg::Dispatch {
                command,
                seq,
                waiter,
            })
            .is_err()
        {
            self.shared.tracker().cancel(&id);
            return Err(self.closed_error());
        }
        debug!(session_id = %self.shared.id, command_id = %id, seq, "command queued");
        Ok(CommandReceipt {
            id,
            outcome,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Force-retire a command without running any more of its script code.
    ///
    /// Returns `false` if the command was not open.
    pub async fn abandon(&self, id: &CommandId) -> Result<bool> {
        let (ack, acked) = oneshot::channel();
        self.mailbox
            .send(SessionMsg::Abandon {
                command_id: id.clone(),
                reason: AbandonReason::Host,
                seq: None,
                ack: Some(ack),
            })
            .map_err(|_| self.closed_error())?;
        acked.await.map_err(|_| self.closed_error())
    }

    /// Abandon every open command and stop the worker.
    pub async fn terminate(&self) {
        let (ack, stopped) = oneshot::channel();
        if self.mailbox.send(SessionMsg::Terminate { ack }).is_ok() {
            let _ = stopped.await;
        }
        self.shared.set_state(SessionState::Terminated);
        info!(session_id = %self.shared.id, "session terminated");
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.shared.state() {
            SessionState::Ready => Ok(()),
            SessionState::Faulted => Err(Error::SessionFaulted(self.shared.id)),
            SessionState::Loading | SessionState::Terminated => {
                Err(Error::SessionTerminated(self.shared.id))
            },
        }
    }

    fn closed_error(&self) -> Error {
        match self.shared.state() {
            SessionState::Faulted => Error::SessionFaulted(self.shared.id),
            _ => Error::SessionTerminated(self.shared.id),
        }
    }
}

/// Resolves once the dispatched command is retired.
pub struct CommandReceipt {
    id: CommandId,
    outcome: oneshot::Receiver<CommandOutcome>,
    shared: Arc<SessionShared>,
}

impl CommandReceipt {
    pub fn id(&self) -> &CommandId {
        &self.id
    }

    pub async fn finished(self) -> CommandOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => {
                let reason = match self.shared.state() {
                    SessionState::Faulted => AbandonReason::SessionFaulted,
                    _ => AbandonReason::SessionTerminated,
                };
                CommandOutcome::Abandoned { reason }
            },
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────────────

struct CommandSlot {
    seq: u64,
    ctx: Option<RegistryKey>,
    waiter: Option<oneshot::Sender<CommandOutcome>>,
    timer: Option<JoinHandle<()>>,
}

/// JSON nulls arrive in scripts as `nil`.
fn script_value_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

struct Worker {
    boundary: Boundary,
    shared: Arc<SessionShared>,
    command_timeout: Option<Duration>,
    api: Option<RegistryKey>,
    commands: HashMap<CommandId, CommandSlot>,
}

impl Worker {
    fn run(
        shared: Arc<SessionShared>,
        options: &SessionOptions,
        source: &str,
        mut inbox: UnboundedReceiver<SessionMsg>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut worker = match Self::start(shared, options, source) {
            Ok(worker) => worker,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            },
        };
        if ready.send(Ok(())).is_err() {
            debug!(session_id = %worker.shared.id, "loader went away before the session was ready");
            return;
        }

        while let Some(message) = inbox.blocking_recv() {
            if !worker.handle(message) {
                break;
            }
        }
        worker.shutdown(&mut inbox);
    }

    fn start(shared: Arc<SessionShared>, options: &SessionOptions, source: &str) -> Result<Self> {
        let boundary = Boundary::new(&options.script_name, &options.limits)?;
        let mut worker = Self {
            boundary,
            shared,
            command_timeout: options.command_timeout,
            api: None,
            commands: HashMap::new(),
        };
        worker.initialize(source)?;
        Ok(worker)
    }

    fn initialize(&mut self, source: &str) -> Result<()> {
        let boundary_error = |e: mlua::Error| Error::from(LoadError::boundary(e.to_string()));
        let lua = self.boundary.lua();
        let api = bind_context(lua, &self.shared, Scope::Init).map_err(boundary_error)?;
        lua.globals()
            .set("api", api.clone())
            .map_err(boundary_error)?;
        self.api = Some(lua.create_registry_value(api).map_err(boundary_error)?);

        self.shared.set_active(Some(Scope::Init));
        let loaded = self.boundary.load(source);
        self.shared.set_active(None);

        if let Some(violation) = self.shared.take_schema_violation() {
            return Err(violation.into());
        }
        loaded?;

        self.shared.registry().seal();
        self.shared.set_state(SessionState::Ready);
        info!(
            session_id = %self.shared.id,
            sandbox_id = %self.shared.sandbox_id,
            script = self.boundary.script_name(),
            hooks = ?self.shared.registry().installed(),
            "session ready"
        );
        Ok(())
    }

    /// Process one message. Returns `false` once the worker should stop.
    fn handle(&mut self, message: SessionMsg) -> bool {
        match message {
            SessionMsg::Dispatch {
                command,
                seq,
                waiter,
            } => self.dispatch(command, seq, waiter),
            SessionMsg::OperationComplete { op_id, reply } => self.complete(op_id, reply),
            SessionMsg::Abandon {
                command_id,
                reason,
                seq,
                ack,
            } => {
                let abandoned = self.abandon(&command_id, reason, seq);
                if let Some(ack) = ack {
                    let _ = ack.send(abandoned);
                }
            },
            SessionMsg::Terminate { ack } => {
                self.shared.set_state(SessionState::Terminated);
                self.retire_all(AbandonReason::SessionTerminated);
                let _ = ack.send(());
                return false;
            },
        }
        self.shared.state() == SessionState::Ready
    }

    fn dispatch(&mut self, command: Command, seq: u64, waiter: oneshot::Sender<CommandOutcome>) {
        let id = command.id.clone();
        let kind = command.kind();
        self.commands.insert(id.clone(), CommandSlot {
            seq,
            ctx: None,
            waiter: Some(waiter),
            timer: None,
        });
        self.shared.remember_message(id.clone(), command.msg.clone());

        let lua = self.boundary.lua();
        let handler = {
            let registry = self.shared.registry();
            match route(&registry, kind) {
                Route::Handler { hook, handler } => {
                    Some((hook, lua.registry_value::<Function>(handler)))
                },
                Route::NoHandler => None,
            }
        };
        let Some((hook, handler)) = handler else {
            self.shared.record(Diagnostic::NoHandler {
                command_id: id.clone(),
                command_kind: kind,
            });
            self.shared
                .tracker()
                .force_retire(&id, CommandOutcome::NoHandler);
            self.settle(&id);
            return;
        };

        debug!(
            session_id = %self.shared.id,
            command_id = %id,
            hook = %hook,
            "invoking handler"
        );
        let scope = Scope::Command {
            id: id.clone(),
            seq,
        };
        let prepared = handler.and_then(|handler| {
            let ctx = bind_context(lua, &self.shared, scope.clone())?;
            let key = lua.create_registry_value(ctx.clone())?;
            let value = lua.to_value_with(&command.to_script_value(), script_value_options())?;
            Ok((handler, ctx, key, value))
        });
        match prepared {
            Ok((handler, ctx, key, value)) => {
                let timer = self.arm_timeout(&id, seq);
                if let Some(slot) = self.commands.get_mut(&id) {
                    slot.ctx = Some(key);
                    slot.timer = timer;
                }
                self.invoke(&scope, &handler, (ctx, value));
            },
            Err(e) => self.fail(&scope, classify(&e)),
        }
        self.settle(&id);
    }

    fn complete(&mut self, op_id: OperationId, reply: Reply) {
        self.shared.finish_request(op_id);
        let resolution = self.shared.continuations().resolve(op_id);
        let operation = match resolution {
            Resolution::Resume(operation) => operation,
            Resolution::Discard(reason) => return self.discard(op_id, reason),
        };
        let callback = self.shared.callbacks().remove(&op_id);
        let Some(callback) = callback else {
            return self.discard(op_id, DiscardReason::UnknownOperation);
        };

        let (scope, ctx_key) = match &operation.command {
            Some(id) => {
                let live = self.shared.tracker().resolve_pending(id);
                match self.commands.get(id) {
                    Some(CommandSlot {
                        seq,
                        ctx: Some(key),
                        ..
                    }) if live => (
                        Scope::Command {
                            id: id.clone(),
                            seq: *seq,
                        },
                        key,
                    ),
                    _ => return self.discard(op_id, DiscardReason::CommandAbandoned),
                }
            },
            None => match &self.api {
                Some(key) => (Scope::Init, key),
                None => return self.discard(op_id, DiscardReason::UnknownOperation),
            },
        };

        let lua = self.boundary.lua();
        let prepared: mlua::Result<(Function, Table, mlua::Value)> = (|| {
            let function = lua.registry_value::<Function>(&callback)?;
            let ctx = lua.registry_value::<Table>(ctx_key)?;
            let value = lua.to_value_with(&reply.to_value(), script_value_options())?;
            Ok((function, ctx, value))
        })();
        drop(callback);

        debug!(
            session_id = %self.shared.id,
            op_id = %op_id,
            operation = %operation.operation,
            waited_ms = u64::try_from(operation.requested_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "resuming callback"
        );
        match prepared {
            Ok((function, ctx, value)) => self.invoke(&scope, &function, (ctx, value)),
            Err(e) => self.fail(&scope, classify(&e)),
        }
        if let Some(id) = scope.command_id() {
            self.settle(id);
        }
    }

    fn discard(&self, op_id: OperationId, reason: DiscardReason) {
        self.shared
            .record(Diagnostic::CompletionDiscarded { op_id, reason });
    }

    fn abandon(&mut self, id: &CommandId, reason: AbandonReason, seq: Option<u64>) -> bool {
        let matches = self
            .commands
            .get(id)
            .is_some_and(|slot| seq.is_none_or(|seq| seq == slot.seq));
        if !matches {
            return false;
        }
        let outcome = CommandOutcome::Abandoned { reason };
        if !self.shared.tracker().force_retire(id, outcome) {
            return false;
        }
        if reason == AbandonReason::Timeout {
            let after_ms = self
                .command_timeout
                .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
            self.shared.record(Diagnostic::TimeoutAbandon {
                command_id: id.clone(),
                after_ms,
            });
        }
        info!(session_id = %self.shared.id, command_id = %id, %reason, "command abandoned");
        self.settle(id);
        true
    }

    fn arm_timeout(&self, id: &CommandId, seq: u64) -> Option<JoinHandle<()>> {
        let timeout = self.command_timeout?;
        let mailbox = self.shared.mailbox();
        let command_id = id.clone();
        Some(self.shared.runtime().spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(SessionMsg::Abandon {
                    command_id,
                    reason: AbandonReason::Timeout,
                    seq: Some(seq),
                    ack: None,
                });
            }
        }))
    }

    fn invoke(&self, scope: &Scope, function: &Function, args: impl IntoLuaMulti) {
        self.shared.set_active(Some(scope.clone()));
        let result = self.boundary.invoke(function, args);
        self.shared.set_active(None);
        if let Err(fault) = result {
            self.fail(scope, fault);
        }
    }

    fn fail(&self, scope: &Scope, fault: ExecutionFault) {
        let command_id = scope.command_id().cloned();
        self.shared.record(Diagnostic::ExecutionFault {
            command_id: command_id.clone(),
            fault: fault.clone(),
        });
        if let Some(id) = &command_id {
            self.shared.tracker().force_retire(id, CommandOutcome::Failed {
                fault: fault.clone(),
            });
        }
        if fault.scope() == FaultScope::Session {
            error!(
                session_id = %self.shared.id,
                used_memory = self.boundary.used_memory(),
                %fault,
                "session faulted"
            );
            self.shared.set_state(SessionState::Faulted);
        }
    }

    /// Deliver the outcome of a retired command and release what it held.
    ///
    /// A command completed by `done()` keeps its context until its pending
    /// operations have called back. A forced one loses them here.
    fn settle(&mut self, id: &CommandId) {
        let outcome = self.shared.tracker().take_outcome(id);
        if let Some(outcome) = outcome {
            let dropped = if outcome.is_completed() {
                0
            } else {
                self.shared.drop_operations(id)
            };
            let outstanding = self.shared.tracker().outstanding(id);
            info!(
                session_id = %self.shared.id,
                command_id = %id,
                outcome = ?outcome,
                outstanding,
                dropped_operations = dropped,
                "command retired"
            );
            if let Some(slot) = self.commands.get_mut(id) {
                if let Some(timer) = slot.timer.take() {
                    timer.abort();
                }
                if let Some(waiter) = slot.waiter.take() {
                    let _ = waiter.send(outcome);
                }
            }
        }
        let released = self.shared.tracker().release(id);
        if released && self.commands.remove(id).is_some() {
            self.shared.forget_message(id);
            debug!(session_id = %self.shared.id, command_id = %id, "command context released");
        }
    }

    fn retire_all(&mut self, reason: AbandonReason) {
        let open = self.shared.tracker().open_ids();
        for id in open {
            if self
                .shared
                .tracker()
                .force_retire(&id, CommandOutcome::Abandoned { reason })
            {
                self.settle(&id);
            }
        }
    }

    fn shutdown(mut self, inbox: &mut UnboundedReceiver<SessionMsg>) {
        if self.shared.state() == SessionState::Ready {
            self.shared.set_state(SessionState::Terminated);
        }
        let reason = match self.shared.state() {
            SessionState::Faulted => AbandonReason::SessionFaulted,
            _ => AbandonReason::SessionTerminated,
        };
        self.retire_all(reason);

        inbox.close();
        while let Ok(message) = inbox.try_recv() {
            match message {
                SessionMsg::Dispatch {
                    command, waiter, ..
                } => {
                    self.shared.tracker().cancel(&command.id);
                    let _ = waiter.send(CommandOutcome::Abandoned { reason });
                },
                SessionMsg::Abandon { ack: Some(ack), .. } => {
                    let _ = ack.send(false);
                },
                SessionMsg::Terminate { ack } => {
                    let _ = ack.send(());
                },
                SessionMsg::Abandon { ack: None, .. } | SessionMsg::OperationComplete { .. } => {},
            }
        }

        let dropped = self.shared.drop_all_operations();
        self.shared.tracker().clear();
        info!(
            session_id = %self.shared.id,
            state = %self.shared.state(),
            dropped_operations = dropped,
            "session worker stopped"
        );
    }
}
