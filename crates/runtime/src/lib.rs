//! Isolated script sessions.
//!
//! A [`Session`] hosts one script in a restricted Lua state. The script
//! installs hooks on the global `api` table while it initializes; afterwards
//! the host dispatches [`Command`](scriptbox_common::Command)s, each routed to
//! its hook. Handlers talk to host resources through asynchronous requests
//! whose callbacks re-enter the script later, and report completion by
//! calling `done()`.

pub mod binder;
pub mod boundary;
pub mod completion;
pub mod continuation;
pub mod diagnostics;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;
mod shared;

pub use {
    binder::{ApiSurface, Intrinsic, SCHEMA_VERSION, Slot},
    boundary::Boundary,
    completion::{AbandonReason, CommandOutcome, CompletionTracker, DoneResult},
    continuation::{ContinuationManager, DiscardReason, PendingOperation, Resolution},
    diagnostics::{Diagnostic, DiagnosticLog},
    error::{Error, ExecutionFault, FaultKind, FaultScope, LoadError, Result, SchemaError},
    registry::{Assignment, HandlerRegistry},
    router::{Route, route},
    session::{CommandReceipt, Session, SessionOptions},
    shared::SessionState,
};
