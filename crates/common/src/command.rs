//! Inbound commands delivered by a transport to a session.

use std::fmt;

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::{
    error::{Error, Result},
    types::CommandId,
};

/// Command name used by transports for inbound user messages.
pub const INBOUND_MESSAGE: &str = "inbound-message";
/// Command name used by transports for inbound delivery events.
pub const INBOUND_EVENT: &str = "inbound-event";

// ── CommandKind ─────────────────────────────────────────────────────────────

/// Routing class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    InboundMessage,
    InboundEvent,
    Unknown,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InboundMessage => "inbound_message",
            Self::InboundEvent => "inbound_event",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// ── Command ─────────────────────────────────────────────────────────────────

/// An inbound unit of work.
///
/// Wire form: `{"cmd": "inbound-message", "cmd_id": "...", "msg": {...}}`.
/// Any additional top-level fields are carried through to the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub cmd: String,
    #[serde(rename = "cmd_id", default = "CommandId::generate")]
    pub id: CommandId,
    #[serde(default)]
    pub msg: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Command {
    pub fn new(id: impl Into<CommandId>, cmd: impl Into<String>, msg: Value) -> Self {
        Self {
            cmd: cmd.into(),
            id: id.into(),
            msg,
            extra: Map::new(),
        }
    }

    pub fn inbound_message(id: impl Into<CommandId>, content: impl Into<String>) -> Self {
        Self::new(
            id,
            INBOUND_MESSAGE,
            serde_json::json!({ "content": content.into() }),
        )
    }

    pub fn inbound_event(id: impl Into<CommandId>, event_type: impl Into<String>) -> Self {
        Self::new(
            id,
            INBOUND_EVENT,
            serde_json::json!({ "event_type": event_type.into() }),
        )
    }

    /// Parse one JSON-encoded command.
    pub fn from_json(raw: &str) -> Result<Self> {
        let command: Self = serde_json::from_str(raw)?;
        if command.cmd.is_empty() && !command.msg.is_object() {
            return Err(Error::invalid_command(
                "command needs either a `cmd` name or an object `msg`",
            ));
        }
        Ok(command)
    }

    /// Routing class of this command.
    ///
    /// The `cmd` name decides when present; a nameless command is classified
    /// by the shape of its `msg` payload.
    pub fn kind(&self) -> CommandKind {
        match self.cmd.as_str() {
            INBOUND_MESSAGE => CommandKind::InboundMessage,
            INBOUND_EVENT => CommandKind::InboundEvent,
            "" if self.msg.get("content").is_some() => CommandKind::InboundMessage,
            "" if self.msg.get("event_type").is_some() => CommandKind::InboundEvent,
            _ => CommandKind::Unknown,
        }
    }

    /// The value handed to script handlers.
    pub fn to_script_value(&self) -> Value {
        let mut object = self.extra.clone();
        object.insert("cmd".into(), Value::String(self.cmd.clone()));
        object.insert("cmd_id".into(), Value::String(self.id.to_string()));
        object.insert("msg".into(), self.msg.clone());
        Value::Object(object)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_cmd_name() {
        assert_eq!(
            Command::inbound_message("1", "hi").kind(),
            CommandKind::InboundMessage
        );
        assert_eq!(
            Command::inbound_event("2", "ack").kind(),
            CommandKind::InboundEvent
        );
        assert_eq!(
            Command::new("3", "outbound.reply_to", Value::Null).kind(),
            CommandKind::Unknown
        );
    }

    #[test]
    fn nameless_command_classified_by_payload_shape() {
        let msg = Command::new("1", "", serde_json::json!({"content": "hello"}));
        assert_eq!(msg.kind(), CommandKind::InboundMessage);

        let event = Command::new("2", "", serde_json::json!({"event_type": "ack"}));
        assert_eq!(event.kind(), CommandKind::InboundEvent);

        let other = Command::new("3", "", serde_json::json!({"foo": 1}));
        assert_eq!(other.kind(), CommandKind::Unknown);
    }

    #[test]
    fn parses_wire_form_and_generates_missing_id() {
        let command =
            Command::from_json(r#"{"cmd": "inbound-message", "msg": {"content": "x"}}"#).unwrap();
        assert_eq!(command.kind(), CommandKind::InboundMessage);
        assert!(!command.id.as_str().is_empty());

        let command = Command::from_json(r#"{"cmd": "foo", "cmd_id": "abc", "key": "k"}"#).unwrap();
        assert_eq!(command.id.as_str(), "abc");
        assert_eq!(command.extra["key"], "k");
    }

    #[test]
    fn rejects_empty_command() {
        assert!(Command::from_json(r#"{"msg": 3}"#).is_err());
        assert!(Command::from_json("not json").is_err());
    }

    #[test]
    fn script_value_exposes_fields() {
        let value = Command::inbound_message("c1", "hello").to_script_value();
        assert_eq!(value["cmd"], "inbound-message");
        assert_eq!(value["cmd_id"], "c1");
        assert_eq!(value["msg"]["content"], "hello");
    }
}
