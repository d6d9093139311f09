//! In-memory key-value resource.
//!
//! Keys are namespaced per sandbox and counted against a per-sandbox limit.
//! Crossing the soft limit logs a warning; at the hard limit new keys are
//! refused with a `"Too many keys"` reply. Existing keys can always be
//! overwritten.

use std::time::{Duration, Instant};

use {
    anyhow::Result,
    async_trait::async_trait,
    dashmap::{DashMap, mapref::entry::Entry as MapEntry},
    scriptbox_common::{Reply, Resource, ResourceContext},
    scriptbox_config::KvResourceConfig,
    serde_json::Value,
    tracing::{error, warn},
};

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The `kv` resource: `set`, `get`, `delete`, `incr`.
pub struct KvResource {
    entries: DashMap<String, Entry>,
    key_counts: DashMap<String, u64>,
    soft_limit: u64,
    hard_limit: u64,
}

impl KvResource {
    pub fn new(soft_limit: u64, hard_limit: u64) -> Self {
        Self {
            entries: DashMap::new(),
            key_counts: DashMap::new(),
            soft_limit,
            hard_limit,
        }
    }

    pub fn from_config(config: &KvResourceConfig) -> Self {
        Self::new(config.soft_limit(), config.keys_per_sandbox_hard)
    }

    /// Number of keys currently counted against a sandbox.
    pub fn key_count(&self, sandbox_id: &str) -> u64 {
        self.key_counts.get(sandbox_id).map(|c| *c).unwrap_or(0)
    }

    fn sandboxed_key(sandbox_id: &str, key: &str) -> String {
        format!("sandboxes#{sandbox_id}#{key}")
    }

    fn adjust_count(&self, sandbox_id: &str, delta: i64) -> u64 {
        let mut count = self.key_counts.entry(sandbox_id.to_string()).or_insert(0);
        *count = count.saturating_add_signed(delta);
        *count
    }

    /// Drop the entry if it has expired, releasing its slot.
    fn evict_expired(&self, sandbox_id: &str, key: &str) {
        let now = Instant::now();
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.adjust_count(sandbox_id, -1);
        }
    }

    /// Count one more key against the sandbox, returning false when the hard
    /// limit is hit.
    ///
    /// Callers hold the vacant entry for the key while reserving, so a key is
    /// counted once no matter how many writers race to create it.
    fn reserve_slot(&self, sandbox_id: &str) -> bool {
        let count = self.adjust_count(sandbox_id, 1);
        if count > self.soft_limit {
            if count <= self.hard_limit {
                warn!(
                    sandbox = sandbox_id,
                    soft_limit = self.soft_limit,
                    hard_limit = self.hard_limit,
                    "kv soft key limit reached; once the hard limit is reached no more keys can be written"
                );
            } else {
                error!(
                    sandbox = sandbox_id,
                    hard_limit = self.hard_limit,
                    "kv hard key limit reached; no more keys can be written"
                );
                self.adjust_count(sandbox_id, -1);
                return false;
            }
        }
        true
    }

    fn require_key(payload: &Value) -> std::result::Result<&str, Reply> {
        payload
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| Reply::failure("key must be a string"))
    }

    fn set(&self, ctx: &ResourceContext, payload: &Value) -> Reply {
        let key = match Self::require_key(payload) {
            Ok(key) => Self::sandboxed_key(&ctx.sandbox_id, key),
            Err(reply) => return reply,
        };
        let expires_at = match payload.get("seconds") {
            None | Some(Value::Null) => None,
            Some(seconds) => match seconds.as_u64() {
                Some(secs) => Some(Instant::now() + Duration::from_secs(secs)),
                None => return Reply::failure("seconds must be a number or null"),
            },
        };
        let entry = Entry {
            value: payload.get("value").cloned().unwrap_or(Value::Null),
            expires_at,
        };
        // An expired entry still holds its slot, so overwriting it is free.
        match self.entries.entry(key) {
            MapEntry::Occupied(mut slot) => {
                slot.insert(entry);
            },
            MapEntry::Vacant(slot) => {
                if !self.reserve_slot(&ctx.sandbox_id) {
                    return Reply::failure("Too many keys");
                }
                slot.insert(entry);
            },
        }
        Reply::ok()
    }

    fn get(&self, ctx: &ResourceContext, payload: &Value) -> Reply {
        let key = match Self::require_key(payload) {
            Ok(key) => Self::sandboxed_key(&ctx.sandbox_id, key),
            Err(reply) => return reply,
        };
        self.evict_expired(&ctx.sandbox_id, &key);
        let value = self
            .entries
            .get(&key)
            .map(|entry| entry.value.clone())
            .unwrap_or(Value::Null);
        Reply::ok().with("value", value)
    }

    fn delete(&self, ctx: &ResourceContext, payload: &Value) -> Reply {
        let key = match Self::require_key(payload) {
            Ok(key) => Self::sandboxed_key(&ctx.sandbox_id, key),
            Err(reply) => return reply,
        };
        self.evict_expired(&ctx.sandbox_id, &key);
        let existed = self.entries.remove(&key).is_some();
        if existed {
            self.adjust_count(&ctx.sandbox_id, -1);
        }
        Reply::ok().with("existed", existed)
    }

    fn incr(&self, ctx: &ResourceContext, payload: &Value) -> Reply {
        let key = match Self::require_key(payload) {
            Ok(key) => Self::sandboxed_key(&ctx.sandbox_id, key),
            Err(reply) => return reply,
        };
        let amount = match payload.get("amount") {
            None | Some(Value::Null) => 1,
            Some(amount) => match amount.as_i64() {
                Some(amount) => amount,
                None => return Reply::failure("amount must be an integer"),
            },
        };
        let zero = || Entry {
            value: Value::from(0),
            expires_at: None,
        };
        let mut entry = match self.entries.entry(key) {
            MapEntry::Occupied(slot) => {
                let mut entry = slot.into_ref();
                if entry.is_expired(Instant::now()) {
                    *entry = zero();
                }
                entry
            },
            MapEntry::Vacant(slot) => {
                if !self.reserve_slot(&ctx.sandbox_id) {
                    return Reply::failure("Too many keys");
                }
                slot.insert(zero())
            },
        };
        let Some(current) = entry.value.as_i64() else {
            return Reply::failure("value is not an integer or out of range");
        };
        let Some(next) = current.checked_add(amount) else {
            return Reply::failure("increment or decrement would overflow");
        };
        entry.value = Value::from(next);
        Reply::ok().with("value", next)
    }
}

#[async_trait]
impl Resource for KvResource {
    fn name(&self) -> &str {
        "kv"
    }

    async fn handle(&self, ctx: &ResourceContext, operation: &str, payload: Value) -> Result<Reply> {
        let reply = match operation {
            "set" => self.set(ctx, &payload),
            "get" => self.get(ctx, &payload),
            "delete" => self.delete(ctx, &payload),
            "incr" => self.incr(ctx, &payload),
            other => Reply::failure(format!("Unknown operation: kv.{other}")),
        };
        Ok(reply)
    }
}
