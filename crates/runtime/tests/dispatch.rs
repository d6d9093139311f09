//! Command routing, continuations, and completion across a live session.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::{sync::Arc, time::Duration};

use {
    common::{APP_LOG_MSG, GatedSink, eventually, load, load_with, options, parked},
    scriptbox_common::{Command, CommandId, HookKind},
    scriptbox_config::LateHookPolicy,
    scriptbox_resources::{LoggingResource, MemoryOutboundSink, OutboundResource, ResourceSet},
    scriptbox_runtime::{
        AbandonReason, CommandOutcome, Diagnostic, Error, FaultKind, Session, SessionOptions,
    },
};

#[tokio::test]
async fn init_runs_once_and_installs_hooks() {
    let sink = GatedSink::open();
    let session = load(APP_LOG_MSG, &sink).await;
    assert_eq!(session.installed_hooks(), vec![
        HookKind::UnknownCommand,
        HookKind::InboundMessage
    ]);
    eventually(|| sink.count("From init!") == 1).await;
}

#[tokio::test]
async fn unregistered_kind_goes_to_fallback() {
    let sink = GatedSink::open();
    let session = load(APP_LOG_MSG, &sink).await;

    let receipt = session
        .dispatch(Command::inbound_event("e1", "ack"))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);

    eventually(|| sink.count("Log successful: true") == 1).await;
    let messages = sink.messages();
    assert!(messages.contains(&"From unknown: inbound-event".to_string()));
    assert!(!messages.iter().any(|m| m.starts_with("Processing")));
}

#[tokio::test]
async fn message_handler_logs_then_completes() {
    let sink = GatedSink::open();
    let session = load(APP_LOG_MSG, &sink).await;

    let receipt = session
        .dispatch(Command::inbound_message("m1", "hello"))
        .unwrap();
    assert_eq!(receipt.id().as_str(), "m1");
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);
    assert!(!session.is_pending(&CommandId::new("m1")));
    assert_eq!(session.open_commands(), 0);

    eventually(|| sink.count("Log successful: true") == 1).await;
    assert_eq!(sink.count("Processing inbound-message: hello"), 1);
    assert!(!sink.messages().iter().any(|m| m.starts_with("From unknown")));

    // The acknowledgement callback fires exactly once.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.count("Log successful: true"), 1);
}

#[tokio::test]
async fn interleaved_commands_retire_independently() {
    let sink = GatedSink::gated("Processing");
    let session = load(APP_LOG_MSG, &sink).await;

    let first = session
        .dispatch(Command::inbound_message("c1", "one"))
        .unwrap();
    let second = session
        .dispatch(Command::inbound_message("c2", "two"))
        .unwrap();
    parked(&sink, 2).await;
    assert_eq!(sink.parked(), vec![
        "Processing inbound-message: one".to_string(),
        "Processing inbound-message: two".to_string(),
    ]);
    assert!(session.is_pending(&CommandId::new("c1")));
    assert!(session.is_pending(&CommandId::new("c2")));

    sink.release("two");
    assert_eq!(second.finished().await, CommandOutcome::Completed);
    assert!(session.is_pending(&CommandId::new("c1")));

    sink.release("one");
    assert_eq!(first.finished().await, CommandOutcome::Completed);
    assert_eq!(session.open_commands(), 0);
}

#[tokio::test]
async fn command_stays_open_until_done() {
    let sink = GatedSink::gated("step");
    let session = load(
        r#"
        api.on_inbound_message = function(ctx, command)
          local remaining = 3
          for i = 1, 3 do
            ctx:log_info("step " .. i, function(ctx, reply)
              remaining = remaining - 1
              if remaining == 0 then ctx:done() end
            end)
          end
        end
        "#,
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "go"))
        .unwrap();
    let id = CommandId::new("c1");
    parked(&sink, 3).await;
    for step in ["step 3", "step 1"] {
        sink.release(step);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.is_pending(&id));
    }
    sink.release("step 2");
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);
    assert!(!session.is_pending(&id));
}

#[tokio::test]
async fn double_done_is_reported_once() {
    let sink = GatedSink::open();
    let session = load(
        "api.on_inbound_message = function(ctx) ctx:done() ctx:done() end",
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "x"))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);
    let doubles: Vec<_> = session
        .diagnostics()
        .into_iter()
        .filter(|d| matches!(d, Diagnostic::DoubleCompletion { .. }))
        .collect();
    assert_eq!(doubles, vec![Diagnostic::DoubleCompletion {
        command_id: CommandId::new("c1")
    }]);
}

#[tokio::test]
async fn abandoned_command_discards_late_completion() {
    let sink = GatedSink::gated("Processing");
    let session = load(APP_LOG_MSG, &sink).await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "hang"))
        .unwrap();
    parked(&sink, 1).await;

    assert!(session.abandon(&CommandId::new("c1")).await.unwrap());
    assert_eq!(receipt.finished().await, CommandOutcome::Abandoned {
        reason: AbandonReason::Host
    });
    assert!(!session.is_pending(&CommandId::new("c1")));
    assert!(!session.abandon(&CommandId::new("c1")).await.unwrap());

    // The parked request is stopped rather than left running.
    eventually(|| sink.stopped() == 1).await;
    sink.release("hang");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sink.messages().iter().any(|m| m.contains("hang")));
    assert!(!sink.messages().iter().any(|m| m.starts_with("Log successful")));
}

#[tokio::test]
async fn callbacks_still_run_after_done() {
    let sink = GatedSink::gated("first");
    let session = load(
        r#"
        api.on_inbound_message = function(ctx, command)
          ctx:log_info("first", function(ctx, reply)
            ctx:log_info("callback ran: " .. tostring(reply.success))
            ctx:done()
          end)
          ctx:done()
        end
        "#,
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "x"))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);
    assert!(!session.is_pending(&CommandId::new("c1")));
    assert_eq!(session.open_commands(), 0);

    parked(&sink, 1).await;
    sink.release("first");
    eventually(|| sink.count("callback ran: true") == 1).await;
    eventually(|| {
        session
            .diagnostics()
            .contains(&Diagnostic::DoubleCompletion {
                command_id: CommandId::new("c1"),
            })
    })
    .await;
    assert!(
        !session
            .diagnostics()
            .iter()
            .any(|d| matches!(d, Diagnostic::CompletionDiscarded { .. }))
    );
}

#[tokio::test]
async fn completed_command_id_is_reusable_once_callbacks_ran() {
    let sink = GatedSink::gated("first");
    let session = load(
        r#"
        api.on_inbound_message = function(ctx, command)
          ctx:log_info("first " .. command.msg.content, function(ctx, reply)
            ctx:log_info("chained", function(ctx, reply)
              ctx:log_info("chain finished")
            end)
          end)
          ctx:done()
        end
        "#,
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "one"))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);

    // The id is still held by its pending callbacks.
    assert!(matches!(
        session.dispatch(Command::inbound_message("c1", "again")),
        Err(Error::DuplicateCommand(_))
    ));

    parked(&sink, 1).await;
    sink.release("first one");
    eventually(|| sink.count("chain finished") == 1).await;

    let mut reused = None;
    for _ in 0..100 {
        if let Ok(receipt) = session.dispatch(Command::inbound_message("c1", "again")) {
            reused = Some(receipt);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    parked(&sink, 1).await;
    sink.release("first again");
    assert_eq!(
        reused.unwrap().finished().await,
        CommandOutcome::Completed
    );
}

#[tokio::test]
async fn command_without_handler_is_dropped() {
    let sink = GatedSink::open();
    let session = load(
        "api.on_inbound_message = function(ctx) ctx:done() end",
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::new("c1", "outbound.reply", serde_json::Value::Null))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::NoHandler);
    assert!(session.diagnostics().iter().any(|d| matches!(
        d,
        Diagnostic::NoHandler { command_id, .. } if command_id.as_str() == "c1"
    )));
}

#[tokio::test]
async fn late_hooks_are_rejected_by_default() {
    let sink = GatedSink::open();
    let script = r#"
        api.on_inbound_message = function(ctx)
          api.on_inbound_event = function(ctx) ctx:done() end
          ctx:done()
        end
    "#;
    let session = load(script, &sink).await;

    let first = session
        .dispatch(Command::inbound_message("m1", "x"))
        .unwrap();
    assert_eq!(first.finished().await, CommandOutcome::Completed);
    assert!(session.diagnostics().contains(&Diagnostic::LateHookRejected {
        hook: HookKind::InboundEvent
    }));

    let event = session
        .dispatch(Command::inbound_event("e1", "ack"))
        .unwrap();
    assert_eq!(event.finished().await, CommandOutcome::NoHandler);
    assert_eq!(session.installed_hooks(), vec![HookKind::InboundMessage]);
}

#[tokio::test]
async fn late_hooks_can_be_accepted() {
    let sink = GatedSink::open();
    let script = r#"
        api.on_inbound_message = function(ctx)
          api.on_inbound_event = function(ctx) ctx:done() end
          ctx:done()
        end
    "#;
    let session = load_with(
        script,
        SessionOptions {
            late_hook_policy: LateHookPolicy::Accept,
            ..options()
        },
        &sink,
    )
    .await;

    let first = session
        .dispatch(Command::inbound_message("m1", "x"))
        .unwrap();
    assert_eq!(first.finished().await, CommandOutcome::Completed);

    let event = session
        .dispatch(Command::inbound_event("e1", "ack"))
        .unwrap();
    assert_eq!(event.finished().await, CommandOutcome::Completed);
    assert!(session.installed_hooks().contains(&HookKind::InboundEvent));
}

#[tokio::test]
async fn stale_context_fails_the_command() {
    let sink = GatedSink::open();
    let session = load(
        r#"
        local saved
        api.on_inbound_message = function(ctx, command)
          if command.msg.content == "first" then
            saved = ctx
          else
            saved:log_info("from the past")
          end
          ctx:done()
        end
        "#,
        &sink,
    )
    .await;

    let first = session
        .dispatch(Command::inbound_message("c1", "first"))
        .unwrap();
    assert_eq!(first.finished().await, CommandOutcome::Completed);

    let second = session
        .dispatch(Command::inbound_message("c2", "second"))
        .unwrap();
    match second.finished().await {
        CommandOutcome::Failed { fault } => {
            assert_eq!(fault.kind, FaultKind::Script);
            assert!(fault.message.contains("context is no longer active"), "{fault}");
        },
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!sink.messages().contains(&"from the past".to_string()));
}

#[tokio::test]
async fn done_on_init_context_is_refused() {
    let sink = GatedSink::open();
    let session = load(
        r#"
        assert(not pcall(api.done))
        api.on_inbound_message = function(ctx) ctx:done() end
        "#,
        &sink,
    )
    .await;
    assert!(session.diagnostics().contains(&Diagnostic::DoneOutsideCommand));
}

#[tokio::test]
async fn requests_reach_resources() {
    let sink = GatedSink::open();
    let session = load(
        r#"
        api.on_inbound_message = function(ctx, command)
          ctx:request("kv.incr", {key = "hits", amount = 2}, function(ctx, reply)
            ctx:request("kv.get", {key = "hits"}, function(ctx, reply)
              ctx:log_info(ctx:sandbox_id() .. " hits=" .. tostring(reply.value))
              ctx:done()
            end)
          end)
        end

        api.on_inbound_event = function(ctx)
          ctx:request("http.get", {url = "x"}, function(ctx, reply)
            ctx:log_info(tostring(reply.success) .. ": " .. reply.reason)
            ctx:done()
          end)
        end
        "#,
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "count"))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);
    eventually(|| sink.count("sandbox-test hits=2") == 1).await;

    let receipt = session
        .dispatch(Command::inbound_event("e1", "fetch"))
        .unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);
    eventually(|| sink.count("false: Unknown resource: http") == 1).await;
}

#[tokio::test]
async fn init_callbacks_run_after_load() {
    let sink = GatedSink::open();
    let session = load(
        r#"
        api.request("kv.set", {key = "boot", value = 1}, function(api, reply)
          api.log_info("booted " .. tostring(reply.success))
        end)
        api.on_inbound_message = function(ctx) ctx:done() end
        "#,
        &sink,
    )
    .await;
    eventually(|| sink.count("booted true") == 1).await;
    assert_eq!(session.open_commands(), 0);
}

#[tokio::test]
async fn restricted_surface_hides_intrinsics() {
    let sink = GatedSink::open();
    let session = load_with(
        r#"
        api.on_inbound_message = function(ctx)
          ctx:request("kv.get", {key = "k"})
          ctx:done()
        end
        "#,
        SessionOptions {
            intrinsics: Some(vec!["log_info".into(), "done".into()]),
            ..options()
        },
        &sink,
    )
    .await;

    let receipt = session
        .dispatch(Command::inbound_message("c1", "x"))
        .unwrap();
    assert!(matches!(
        receipt.finished().await,
        CommandOutcome::Failed { fault } if fault.kind == FaultKind::Script
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callbacks_never_overlap() {
    let sink = GatedSink::open();
    let session = load(
        r#"
        local depth = 0
        api.on_inbound_message = function(ctx, command)
          local remaining = 5
          for i = 1, 5 do
            ctx:log_debug(command.msg.content .. " tick " .. i, function(ctx, reply)
              depth = depth + 1
              assert(depth == 1, "overlapping invocation")
              for _ = 1, 2000 do end
              depth = depth - 1
              remaining = remaining - 1
              if remaining == 0 then ctx:done() end
            end)
          end
        end
        "#,
        &sink,
    )
    .await;

    let receipts: Vec<_> = (0..20)
        .map(|i| {
            session
                .dispatch(Command::inbound_message(format!("c{i}"), format!("m{i}")))
                .unwrap()
        })
        .collect();
    for receipt in receipts {
        assert_eq!(receipt.finished().await, CommandOutcome::Completed);
    }
    assert_eq!(session.open_commands(), 0);
}

#[tokio::test]
async fn replies_address_the_inbound_message() {
    let sink = GatedSink::open();
    let outbound = Arc::new(MemoryOutboundSink::new());
    let resources = ResourceSet::new()
        .with(Arc::new(LoggingResource::new(Arc::clone(&sink))))
        .with(Arc::new(OutboundResource::new(
            outbound.clone(),
            ["default".to_string()],
            Vec::new(),
        )));
    let session = Session::load(
        r#"
        api.on_inbound_message = function(ctx, command)
          ctx:request("outbound.reply_to", {
            content = "echo: " .. command.msg.content,
            in_reply_to = command.msg.message_id,
          }, function(ctx, reply)
            ctx:log_info("reply sent: " .. tostring(reply.success))
            ctx:done()
          end)
        end
        "#,
        options(),
        Arc::new(resources),
    )
    .await
    .unwrap();

    let command = Command::new(
        "m1",
        "inbound-message",
        serde_json::json!({"message_id": "msg-1", "from_addr": "+2712", "content": "hi"}),
    );
    let receipt = session.dispatch(command).unwrap();
    assert_eq!(receipt.finished().await, CommandOutcome::Completed);
    eventually(|| sink.count("reply sent: true") == 1).await;

    let sent = outbound.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to_addr.as_deref(), Some("+2712"));
    assert_eq!(sent[0].in_reply_to.as_deref(), Some("msg-1"));
    assert_eq!(sent[0].content.as_deref(), Some("echo: hi"));
}
