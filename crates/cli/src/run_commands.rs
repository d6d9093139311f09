//! `scriptbox run` and `scriptbox check`.
//!
//! `run` reads one JSON command per line, dispatches each to the script as
//! soon as it is read, and prints one JSON line per retired command in the
//! order they finish.

use std::{io::Write, path::Path, sync::Arc};

use {
    anyhow::{Context, Result},
    futures::{StreamExt, stream::FuturesUnordered},
    scriptbox_common::{Command, CommandId},
    scriptbox_config::ScriptboxConfig,
    scriptbox_resources::{ResourceSet, TracingLogSink},
    scriptbox_runtime::{CommandOutcome, Error, Session, SessionOptions},
    tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    tracing::{info, warn},
};

async fn load_session(config: &ScriptboxConfig, script: &Path) -> Result<Session> {
    let source = tokio::fs::read_to_string(script)
        .await
        .with_context(|| format!("failed to read {}", script.display()))?;
    let mut options = SessionOptions::from_config(config)?;
    if let Some(stem) = script.file_stem().and_then(|s| s.to_str())
        && config.sandbox.script_name == "app"
    {
        options.script_name = stem.to_string();
    }
    let resources = ResourceSet::from_config(&config.resources, Arc::new(TracingLogSink))?;
    let session = Session::load(source, options, Arc::new(resources)).await?;
    Ok(session)
}

pub async fn check(config: &ScriptboxConfig, script: &Path) -> Result<()> {
    let session = load_session(config, script).await?;
    let hooks = session.installed_hooks();
    println!("{}: ok", script.display());
    if hooks.is_empty() {
        println!("  no hooks installed");
    }
    for hook in hooks {
        println!("  {}", hook.slot_name());
    }
    session.terminate().await;
    Ok(())
}

async fn open_commands(source: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if source == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("failed to open {source}"))?;
    Ok(Box::new(BufReader::new(file)))
}

fn outcome_line(id: &CommandId, outcome: &CommandOutcome) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::json!({
        "cmd_id": id,
        "outcome": outcome,
    }))?)
}

pub async fn run(
    config: &ScriptboxConfig,
    script: &Path,
    commands: Option<&str>,
    out: &mut impl Write,
) -> Result<()> {
    let session = load_session(config, script).await?;
    let Some(commands) = commands else {
        session.terminate().await;
        return Ok(());
    };

    let mut lines = open_commands(commands).await?.lines();
    let mut running = FuturesUnordered::new();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let command = match Command::from_json(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed command");
                continue;
            },
        };

        loop {
            match session.dispatch(command.clone()) {
                Ok(receipt) => {
                    let id = receipt.id().clone();
                    running.push(async move { (id, receipt.finished().await) });
                    break;
                },
                // Wait for a slot to free up, then retry.
                Err(Error::Backpressure { .. }) if !running.is_empty() => {
                    if let Some((id, outcome)) = running.next().await {
                        writeln!(out, "{}", outcome_line(&id, &outcome)?)?;
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    while let Some((id, outcome)) = running.next().await {
        writeln!(out, "{}", outcome_line(&id, &outcome)?)?;
    }

    let diagnostics = session.diagnostics();
    info!(
        commands = line_no,
        diagnostics = diagnostics.len(),
        "all commands retired"
    );
    session.terminate().await;
    Ok(())
}
