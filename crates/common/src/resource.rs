//! The contract between the runtime and host-side resources.
//!
//! A resource is a named service (`log`, `kv`, ...) that scripts reach through
//! the `request` intrinsic as `"<resource>.<operation>"`. Resources run outside
//! the isolation boundary on the async runtime; their result travels back to
//! the script as a [`Reply`].

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, serde_json::Value};

use crate::{
    reply::Reply,
    types::{CommandId, SessionId},
};

/// Who is asking: the session and, when known, the command being processed.
#[derive(Debug, Clone)]
pub struct ResourceContext {
    pub session_id: SessionId,
    /// Namespace for per-sandbox state such as key-value entries.
    pub sandbox_id: String,
    pub command_id: Option<CommandId>,
    /// The `msg` payload of that command, used to address replies.
    pub message: Option<Arc<Value>>,
}

/// Trait implemented by every host-side resource.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Name used as the prefix of request names (`kv` in `kv.set`).
    fn name(&self) -> &str;

    /// Handle one operation.
    ///
    /// Validation problems should be reported as a failed [`Reply`]; an `Err`
    /// is reserved for unexpected failures and is turned into a failed reply
    /// by the caller.
    async fn handle(&self, ctx: &ResourceContext, operation: &str, payload: Value)
    -> Result<Reply>;
}

/// Split `kv.set` into `("kv", "set")`.
pub fn split_request_name(name: &str) -> Option<(&str, &str)> {
    let (resource, operation) = name.split_once('.')?;
    if resource.is_empty() || operation.is_empty() {
        return None;
    }
    Some((resource, operation))
}
