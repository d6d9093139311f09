//! Outbound message resource.
//!
//! Scripts send messages with `outbound.reply_to`, `outbound.reply_to_group`,
//! `outbound.send_to` and `outbound.send_to_endpoint`. Replies address the
//! inbound message of the command that made the request. Validated messages
//! go to an [`OutboundSink`]; the default one emits them as tracing events.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    sync::{Arc, Mutex},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    scriptbox_common::{CommandId, Reply, Resource, ResourceContext},
    scriptbox_config::OutboundResourceConfig,
    serde::Serialize,
    serde_json::{Map, Value},
    tracing::{info, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    /// To the sender of an inbound message.
    Reply,
    /// To the group an inbound message came from.
    ReplyToGroup,
    /// To an address through an endpoint.
    Send,
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reply => "reply",
            Self::ReplyToGroup => "reply_to_group",
            Self::Send => "send",
        };
        f.write_str(name)
    }
}

/// A message a script asked the host to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub kind: OutboundKind,
    pub content: Option<String>,
    pub to_addr: Option<String>,
    pub group: Option<String>,
    pub endpoint: String,
    pub in_reply_to: Option<String>,
    pub continue_session: bool,
    pub helper_metadata: Map<String, Value>,
}

// ── OutboundSink ────────────────────────────────────────────────────────────

/// Transport that delivers outbound messages.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, ctx: &ResourceContext, message: &OutboundMessage) -> Result<()>;
}

/// Sink that records outbound messages as tracing events.
#[derive(Debug, Default)]
pub struct TracingOutboundSink;

#[async_trait]
impl OutboundSink for TracingOutboundSink {
    async fn send(&self, ctx: &ResourceContext, message: &OutboundMessage) -> Result<()> {
        info!(
            target: "scriptbox::outbound",
            sandbox = %ctx.sandbox_id,
            command = ctx.command_id.as_ref().map(CommandId::as_str),
            kind = %message.kind,
            to_addr = message.to_addr.as_deref(),
            group = message.group.as_deref(),
            endpoint = %message.endpoint,
            in_reply_to = message.in_reply_to.as_deref(),
            content = message.content.as_deref(),
            "outbound message"
        );
        Ok(())
    }
}

/// Sink that keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemoryOutboundSink {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl MemoryOutboundSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl OutboundSink for MemoryOutboundSink {
    async fn send(&self, _ctx: &ResourceContext, message: &OutboundMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}

// ── Parameters ──────────────────────────────────────────────────────────────

type Param<T> = std::result::Result<T, String>;

fn optional_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn content(payload: &Value) -> Param<Option<String>> {
    match payload.get("content") {
        None => Err("'content' must be given.".into()),
        Some(Value::Null) => Ok(None),
        Some(Value::String(content)) => Ok(Some(content.clone())),
        Some(_) => Err("'content' must be a string or null.".into()),
    }
}

fn continue_session(payload: &Value) -> Param<bool> {
    match payload.get("continue_session") {
        None => Ok(true),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err("'continue_session' must be either true or false if given".into()),
    }
}

fn to_addr(payload: &Value) -> Param<String> {
    optional_str(payload, "to_addr")
        .map(str::to_string)
        .ok_or_else(|| "'to_addr' must be given in sends.".into())
}

/// The inbound message being replied to.
fn in_reply_to(ctx: &ResourceContext, payload: &Value) -> Param<Arc<Value>> {
    let Some(id) = optional_str(payload, "in_reply_to") else {
        return Err("'in_reply_to' must be given.".into());
    };
    ctx.message
        .as_ref()
        .filter(|message| optional_str(message, "message_id") == Some(id))
        .cloned()
        .ok_or_else(|| format!("Could not find original message with id: {id:?}"))
}

// ── OutboundResource ────────────────────────────────────────────────────────

/// The `outbound` resource.
pub struct OutboundResource {
    sink: Arc<dyn OutboundSink>,
    endpoints: HashSet<String>,
    allowed_helper_metadata: BTreeSet<String>,
}

impl OutboundResource {
    pub fn new(
        sink: Arc<dyn OutboundSink>,
        endpoints: impl IntoIterator<Item = String>,
        allowed_helper_metadata: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            sink,
            endpoints: endpoints.into_iter().collect(),
            allowed_helper_metadata: allowed_helper_metadata.into_iter().collect(),
        }
    }

    pub fn from_config(config: &OutboundResourceConfig, sink: Arc<dyn OutboundSink>) -> Self {
        Self::new(
            sink,
            config.endpoints.iter().cloned(),
            config.allowed_helper_metadata.iter().cloned(),
        )
    }

    fn endpoint(&self, payload: &Value, default: Option<&str>) -> Param<String> {
        let endpoint = match payload.get("endpoint") {
            None => default,
            Some(value) => value.as_str(),
        };
        let Some(endpoint) = endpoint else {
            return Err("'endpoint' must be given in sends.".into());
        };
        if !self.endpoints.contains(endpoint) {
            return Err(format!("Endpoint {endpoint:?} not configured"));
        }
        Ok(endpoint.to_string())
    }

    fn helper_metadata(&self, payload: &Value) -> Param<Map<String, Value>> {
        let metadata = match payload.get("helper_metadata") {
            None | Some(Value::Null) => return Ok(Map::new()),
            Some(Value::Object(metadata)) if metadata.is_empty() => return Ok(Map::new()),
            Some(metadata) => metadata,
        };
        if self.allowed_helper_metadata.is_empty() {
            return Err("'helper_metadata' is not allowed".into());
        }
        let Value::Object(metadata) = metadata else {
            return Err("'helper_metadata' must be object or null.".into());
        };
        if metadata
            .keys()
            .any(|key| !self.allowed_helper_metadata.contains(key))
        {
            let allowed: Vec<&str> = self
                .allowed_helper_metadata
                .iter()
                .map(String::as_str)
                .collect();
            return Err(format!(
                "'helper_metadata' may only contain the following keys: {}",
                allowed.join(", ")
            ));
        }
        Ok(metadata.clone())
    }

    fn reply(&self, ctx: &ResourceContext, payload: &Value, kind: OutboundKind) -> Param<OutboundMessage> {
        let content = content(payload)?;
        let original = in_reply_to(ctx, payload)?;
        let continue_session = continue_session(payload)?;
        let helper_metadata = self.helper_metadata(payload)?;
        let (to_addr, group) = match kind {
            OutboundKind::ReplyToGroup => (None, optional_str(&original, "group")),
            _ => (optional_str(&original, "from_addr"), None),
        };
        Ok(OutboundMessage {
            kind,
            content,
            to_addr: to_addr.map(str::to_string),
            group: group.map(str::to_string),
            endpoint: optional_str(&original, "endpoint")
                .unwrap_or("default")
                .to_string(),
            in_reply_to: optional_str(&original, "message_id").map(str::to_string),
            continue_session,
            helper_metadata,
        })
    }

    fn send(&self, payload: &Value, default_endpoint: Option<&str>) -> Param<OutboundMessage> {
        let content = content(payload)?;
        let to_addr = to_addr(payload)?;
        let endpoint = self.endpoint(payload, default_endpoint)?;
        let helper_metadata = self.helper_metadata(payload)?;
        Ok(OutboundMessage {
            kind: OutboundKind::Send,
            content,
            to_addr: Some(to_addr),
            group: None,
            endpoint,
            in_reply_to: None,
            continue_session: true,
            helper_metadata,
        })
    }
}

#[async_trait]
impl Resource for OutboundResource {
    fn name(&self) -> &str {
        "outbound"
    }

    async fn handle(&self, ctx: &ResourceContext, operation: &str, payload: Value) -> Result<Reply> {
        let message = match operation {
            "reply_to" => self.reply(ctx, &payload, OutboundKind::Reply),
            "reply_to_group" => self.reply(ctx, &payload, OutboundKind::ReplyToGroup),
            "send_to" => self.send(&payload, Some("default")),
            "send_to_endpoint" => self.send(&payload, None),
            other => return Ok(Reply::failure(format!("Unknown operation: outbound.{other}"))),
        };
        let message = match message {
            Ok(message) => message,
            Err(reason) => return Ok(Reply::failure(reason)),
        };
        match self.sink.send(ctx, &message).await {
            Ok(()) => Ok(Reply::ok()),
            Err(e) => {
                warn!(sandbox = %ctx.sandbox_id, error = %e, "outbound send failed");
                Ok(Reply::failure(e.to_string()))
            },
        }
    }
}
