//! Shared types, error definitions, and the resource contract used across all
//! scriptbox crates.

pub mod command;
pub mod error;
pub mod hooks;
pub mod reply;
pub mod resource;
pub mod types;

pub use {
    command::{Command, CommandKind},
    error::{Error, Result},
    hooks::HookKind,
    reply::Reply,
    resource::{Resource, ResourceContext, split_request_name},
    types::{CommandId, OperationId, OperationIdAllocator, SessionId},
};
