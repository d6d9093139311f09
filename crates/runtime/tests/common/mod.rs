//! Shared fixtures for the session integration tests.
#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    scriptbox_common::ResourceContext,
    scriptbox_resources::{KvResource, LogLevel, LogSink, LoggingResource, ResourceSet},
    scriptbox_runtime::{Session, SessionOptions},
    tokio::sync::oneshot,
};

/// The reference application: logs every command and completes it once the
/// log line is acknowledged.
pub const APP_LOG_MSG: &str = r#"
api.log_info("From init!")

api.on_unknown_command = function(ctx, command)
  ctx:log_info("From unknown: " .. tostring(command.cmd), function(ctx, reply)
    ctx:log_info("Log successful: " .. tostring(reply.success))
    ctx:done()
  end)
end

api.on_inbound_message = function(ctx, command)
  ctx:log_info("Processing inbound-message: " .. command.msg.content, function(ctx, reply)
    ctx:log_info("Log successful: " .. tostring(reply.success))
    ctx:done()
  end)
end
"#;

// ── GatedSink ───────────────────────────────────────────────────────────────

/// Log sink that records every line and parks the writes matching a pattern
/// until the test releases them.
#[derive(Default)]
pub struct GatedSink {
    gate: Option<String>,
    written: Mutex<Vec<String>>,
    parked: Mutex<Vec<(String, oneshot::Sender<()>)>>,
}

impl GatedSink {
    pub fn open() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated(pattern: &str) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(pattern.to_string()),
            ..Self::default()
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn count(&self, message: &str) -> usize {
        self.messages().iter().filter(|m| *m == message).count()
    }

    pub fn parked(&self) -> Vec<String> {
        self.parked
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    /// Parked writes whose request was stopped before being released.
    pub fn stopped(&self) -> usize {
        self.parked
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, release)| release.is_closed())
            .count()
    }

    /// Let the first parked write containing `needle` finish.
    pub fn release(&self, needle: &str) {
        let mut parked = self.parked.lock().unwrap();
        let index = parked
            .iter()
            .position(|(m, _)| m.contains(needle))
            .unwrap_or_else(|| panic!("no parked write matches {needle:?}"));
        let (_, release) = parked.remove(index);
        let _ = release.send(());
    }
}

#[async_trait]
impl LogSink for GatedSink {
    async fn write(&self, _ctx: &ResourceContext, _level: LogLevel, message: &str) -> anyhow::Result<()> {
        if self.gate.as_deref().is_some_and(|gate| message.contains(gate)) {
            let (release, released) = oneshot::channel();
            self.parked
                .lock()
                .unwrap()
                .push((message.to_string(), release));
            let _ = released.await;
        }
        self.written.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

pub fn options() -> SessionOptions {
    SessionOptions {
        sandbox_id: "sandbox-test".into(),
        ..SessionOptions::default()
    }
}

pub fn resources(sink: &Arc<GatedSink>) -> Arc<ResourceSet> {
    Arc::new(
        ResourceSet::new()
            .with(Arc::new(LoggingResource::new(Arc::clone(sink))))
            .with(Arc::new(KvResource::new(100, 100))),
    )
}

pub async fn load(source: &str, sink: &Arc<GatedSink>) -> Session {
    Session::load(source, options(), resources(sink)).await.unwrap()
}

pub async fn load_with(source: &str, options: SessionOptions, sink: &Arc<GatedSink>) -> Session {
    Session::load(source, options, resources(sink)).await.unwrap()
}

/// Poll until `check` holds, failing the test after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Wait until `sink` has parked `n` writes.
pub async fn parked(sink: &Arc<GatedSink>, n: usize) {
    eventually(|| sink.parked().len() >= n).await;
}
