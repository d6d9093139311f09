//! File-backed configuration resource.
//!
//! `config.get {key}` returns the contents of the file the host mapped to
//! `key`. Scripts never see the file path and cannot read unmapped files.

use std::{collections::HashMap, path::PathBuf};

use {
    anyhow::Result,
    async_trait::async_trait,
    scriptbox_common::{Reply, Resource, ResourceContext},
    serde_json::Value,
    tracing::warn,
};

pub struct FileConfigResource {
    keys: HashMap<String, PathBuf>,
}

impl FileConfigResource {
    pub fn new(keys: HashMap<String, PathBuf>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Resource for FileConfigResource {
    fn name(&self) -> &str {
        "config"
    }

    async fn handle(&self, ctx: &ResourceContext, operation: &str, payload: Value) -> Result<Reply> {
        if operation != "get" {
            return Ok(Reply::failure(format!("Unknown operation: config.{operation}")));
        }
        let key = payload.get("key").and_then(Value::as_str).unwrap_or_default();
        let Some(path) = self.keys.get(key) else {
            return Ok(Reply::failure(format!("Configuration key {key:?} not found")));
        };
        match tokio::fs::read_to_string(path).await {
            Ok(value) => Ok(Reply::ok().with("value", value)),
            Err(e) => {
                warn!(sandbox = %ctx.sandbox_id, path = %path.display(), error = %e, "config file unreadable");
                Ok(Reply::failure(format!("Cannot read file {:?}", path.display().to_string())))
            },
        }
    }
}
