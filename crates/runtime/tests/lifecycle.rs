//! Loading, limits, faults, and teardown of sessions.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::{sync::Arc, time::Duration};

use {
    common::{APP_LOG_MSG, GatedSink, eventually, load, load_with, options, parked, resources},
    scriptbox_common::{Command, CommandId},
    scriptbox_config::{LimitsConfig, ScriptboxConfig},
    scriptbox_resources::ResourceSet,
    scriptbox_runtime::{
        AbandonReason, CommandOutcome, Diagnostic, Error, FaultKind, LoadError, SchemaError,
        Session, SessionOptions, SessionState,
    },
};

async fn load_err(source: &str, options: SessionOptions) -> Error {
    match Session::load(source, options, Arc::new(ResourceSet::new())).await {
        Ok(_) => panic!("script unexpectedly loaded"),
        Err(e) => e,
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn syntax_error_never_reaches_ready() {
    let err = load_err("api.on_inbound_message = function(ctx", options()).await;
    assert!(
        matches!(&err, Error::Load(LoadError::Syntax { script, .. }) if script == "app"),
        "{err}"
    );
}

#[tokio::test]
async fn init_runtime_error_fails_load() {
    let err = load_err("error('no config')", options()).await;
    match err {
        Error::Load(LoadError::Initialization { message, .. }) => {
            assert!(message.contains("no config"), "{message}");
        },
        other => panic!("unexpected {other}"),
    }
}

#[tokio::test]
async fn runaway_init_fails_load() {
    let err = load_err("while true do end", SessionOptions {
        limits: LimitsConfig {
            instruction_budget: 100_000,
            ..LimitsConfig::default()
        },
        ..options()
    })
    .await;
    assert!(matches!(err, Error::Load(LoadError::Initialization { .. })), "{err}");
}

#[tokio::test]
async fn unknown_hooks_are_schema_errors() {
    let err = load_err("api.on_outbound_message = function() end", options()).await;
    assert!(matches!(
        err,
        Error::Schema(SchemaError::UnknownHook { ref name }) if name == "on_outbound_message"
    ));

    // Swallowing the error does not make the script valid.
    let err = load_err(
        "pcall(function() api.on_typo = function() end end)",
        options(),
    )
    .await;
    assert!(matches!(err, Error::Schema(SchemaError::UnknownHook { .. })));
}

#[tokio::test]
async fn hooks_must_be_functions() {
    let err = load_err("api.on_inbound_message = 42", options()).await;
    assert!(matches!(
        err,
        Error::Schema(SchemaError::InvalidHook { ref name, ref type_name })
            if name == "on_inbound_message" && type_name == "integer"
    ));
}

#[tokio::test]
async fn intrinsics_cannot_be_overwritten() {
    let err = load_err("api.done = function() end", options()).await;
    assert!(matches!(err, Error::Load(LoadError::Initialization { .. })));
}

#[tokio::test]
async fn configured_intrinsics_are_validated() {
    let err = load_err("", SessionOptions {
        intrinsics: Some(vec!["log_info".into(), "http_get".into(), "done".into()]),
        ..options()
    })
    .await;
    assert!(matches!(
        err,
        Error::Schema(SchemaError::UnknownIntrinsic { ref name, version: 1 }) if name == "http_get"
    ));

    let err = load_err("", SessionOptions {
        intrinsics: Some(vec!["log_info".into()]),
        ..options()
    })
    .await;
    assert!(matches!(
        err,
        Error::Schema(SchemaError::MissingIntrinsic { name: "done" })
    ));
}

#[tokio::test]
async fn options_follow_config() {
    let mut config = ScriptboxConfig::default();
    config.sandbox.id = Some("from-config".into());
    config.sandbox.command_timeout_ms = Some(250);
    let options = SessionOptions::from_config(&config).unwrap();
    assert_eq!(options.sandbox_id, "from-config");
    assert_eq!(options.command_timeout, Some(Duration::from_millis(250)));

    config.sandbox.max_open_commands = 0;
    assert!(matches!(
        SessionOptions::from_config(&config),
        Err(Error::Config { .. })
    ));
}

// ── Limits and faults ───────────────────────────────────────────────────────

const SPIN_OR_DONE: &str = r#"
api.on_inbound_message = function(ctx, command)
  if command.msg.content == "spin" then
    while true do end
  end
  ctx:done()
end
"#;

#[tokio::test]
async fn instruction_budget_fails_only_the_command() {
    let sink = GatedSink::open();
    let session = load_with(
        SPIN_OR_DONE,
        SessionOptions {
            limits: LimitsConfig {
                instruction_budget: 100_000,
                ..LimitsConfig::default()
            },
            ..options()
        },
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "spin"))
        .unwrap();
    match receipt.finished().await {
        CommandOutcome::Failed { fault } => assert_eq!(fault.kind, FaultKind::InstructionBudget),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Ready);

    let receipt = session
        .dispatch(Command::inbound_message("c2", "ok"))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);
}

#[tokio::test]
async fn memory_exhaustion_faults_the_session() {
    let sink = GatedSink::gated("Processing");
    let script = r#"
        api.on_inbound_message = function(ctx, command)
          if command.msg.content == "hog" then
            local t = {}
            for i = 1, 1e7 do t[i] = string.rep("x", 64) .. i end
          end
          ctx:log_info("Processing " .. command.msg.content, function(ctx) ctx:done() end)
        end
    "#;
    let session = load_with(
        script,
        SessionOptions {
            limits: LimitsConfig {
                memory_bytes: 4 * 1024 * 1024,
                ..LimitsConfig::default()
            },
            ..options()
        },
        &sink,
    )
    .await;

    let waiting = session
        .dispatch(Command::inbound_message("c1", "wait"))
        .unwrap();
    parked(&sink, 1).await;

    let hog = session
        .dispatch(Command::inbound_message("c2", "hog"))
        .unwrap();
    match hog.finished().await {
        CommandOutcome::Failed { fault } => assert_eq!(fault.kind, FaultKind::Memory),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(waiting.finished().await, CommandOutcome::Abandoned {
        reason: AbandonReason::SessionFaulted
    });
    assert_eq!(session.state(), SessionState::Faulted);
    assert!(matches!(
        session.dispatch(Command::inbound_message("c3", "x")),
        Err(Error::SessionFaulted(_))
    ));
}

#[tokio::test]
async fn timed_out_commands_are_abandoned() {
    let sink = GatedSink::gated("Processing");
    let session = load_with(
        APP_LOG_MSG,
        SessionOptions {
            command_timeout: Some(Duration::from_millis(50)),
            ..options()
        },
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "slow"))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Abandoned {
        reason: AbandonReason::Timeout
    });
    assert!(session.diagnostics().contains(&Diagnostic::TimeoutAbandon {
        command_id: CommandId::new("c1"),
        after_ms: 50,
    }));
}

#[tokio::test]
async fn open_command_limit_applies_backpressure() {
    let sink = GatedSink::gated("Processing");
    let session = load_with(
        APP_LOG_MSG,
        SessionOptions {
            max_open_commands: 1,
            ..options()
        },
        &sink,
    )
    .await;

    let first = session
        .dispatch(Command::inbound_message("c1", "one"))
        .unwrap();
    assert!(matches!(
        session.dispatch(Command::inbound_message("c2", "two")),
        Err(Error::Backpressure { open: 1, limit: 1 })
    ));

    parked(&sink, 1).await;
    sink.release("one");
    assert_eq!(first.finished().await, CommandOutcome::Completed);
    session
        .dispatch(Command::inbound_message("c2", "two"))
        .unwrap();
}

#[tokio::test]
async fn open_ids_cannot_be_reused() {
    let sink = GatedSink::gated("Processing");
    let session = load(APP_LOG_MSG, &sink).await;

    let first = session
        .dispatch(Command::inbound_message("c1", "one"))
        .unwrap();
    assert!(matches!(
        session.dispatch(Command::inbound_message("c1", "again")),
        Err(Error::DuplicateCommand(id)) if id.as_str() == "c1"
    ));

    parked(&sink, 1).await;
    sink.release("one");
    assert_eq!(first.finished().await, CommandOutcome::Completed);

    // A retired id may be dispatched again.
    let again = session
        .dispatch(Command::inbound_message("c1", "again"))
        .unwrap();
    parked(&sink, 1).await;
    sink.release("again");
    assert_eq!(again.finished().await, CommandOutcome::Completed);
}

// ── Teardown ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn terminate_abandons_open_commands() {
    let sink = GatedSink::gated("Processing");
    let session = load(APP_LOG_MSG, &sink).await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "pending"))
        .unwrap();
    parked(&sink, 1).await;

    session.terminate().await;
    assert_eq!(receipt.finished().await, CommandOutcome::Abandoned {
        reason: AbandonReason::SessionTerminated
    });
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(
        session.dispatch(Command::inbound_message("c2", "x")),
        Err(Error::SessionTerminated(_))
    ));

    sink.release("pending");
    eventually(|| sink.messages().iter().any(|m| m.contains("pending"))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sink.messages().iter().any(|m| m.starts_with("Log successful")));
}

#[tokio::test]
async fn dropping_every_handle_stops_the_worker() {
    let sink = GatedSink::gated("Processing");
    let session = Session::load(APP_LOG_MSG, options(), resources(&sink))
        .await
        .unwrap();
    let receipt = session
        .dispatch(Command::inbound_message("c1", "orphan"))
        .unwrap();
    parked(&sink, 1).await;

    drop(session);
    assert_eq!(receipt.finished().await, CommandOutcome::Abandoned {
        reason: AbandonReason::SessionTerminated
    });
}
