//! Result objects delivered to script reply callbacks.

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

/// A reply to an asynchronous host operation.
///
/// Always carries `success`; failures also carry a human-readable `reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            success: true,
            fields: Map::new(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("reason".into(), Value::String(reason.into()));
        Self {
            success: false,
            fields,
        }
    }

    /// Attach an extra field (e.g. `value`, `existed`).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.fields.get("reason").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("success".into(), Value::Bool(self.success));
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_carries_reason() {
        let reply = Reply::failure("Too many keys");
        assert!(!reply.success);
        assert_eq!(reply.reason(), Some("Too many keys"));
        assert_eq!(
            reply.to_value(),
            serde_json::json!({"success": false, "reason": "Too many keys"})
        );
    }

    #[test]
    fn ok_with_fields() {
        let reply = Reply::ok().with("value", 42);
        assert_eq!(
            reply.to_value(),
            serde_json::json!({"success": true, "value": 42})
        );
    }
}
