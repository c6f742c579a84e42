mod app;
mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use huddle_agents::{Progress, ProgressEvent, StopReason, TurnRequest};
use huddle_common::UserContext;
use huddle_config::{AppConfig, ConfigLoader};
use huddle_security::RedactingWriter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader
        .load()
        .with_context(|| format!("failed to load config from {}", loader.path().display()))?;

    init_tracing(&config.log.level, cli.json_logs || config.log.json);

    match cli.command {
        Command::Ask {
            conversation,
            name,
            user_id,
            timezone,
            json_progress,
            text,
        } => {
            let user = UserContext {
                display_name: name,
                platform_user_id: user_id,
                timezone,
            };
            ask(&config, conversation, user, text.join(" "), json_progress).await
        }
        Command::History { conversation } => {
            let store = app::open_store(&config.store)?;
            let history = store.get(&conversation).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
        Command::Purge => {
            let store = app::open_store(&config.store)?;
            let purged = store.purge_expired().await?;
            println!("purged {purged} expired conversation(s)");
            Ok(())
        }
        Command::Check => check(&config).await,
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(RedactingWriter::stderr());

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn ask(
    config: &AppConfig,
    conversation: Option<String>,
    user: UserContext,
    input: String,
    json_progress: bool,
) -> Result<()> {
    let store = app::open_store(&config.store)?;
    let runtime = app::build_runtime(config, store)?;

    let conversation_id =
        conversation.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4().simple()));
    eprintln!("conversation: {conversation_id}");

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling turn");
            on_ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_progress(&event, json_progress);
        }
    });

    let request = TurnRequest::new(conversation_id, input)
        .with_user_context(user)
        .with_progress(Progress::new(Arc::new(tx)))
        .with_cancellation(cancel);
    let result = runtime.process_turn(request).await;
    // The request owned the only sender, so the printer drains and stops.
    let _ = printer.await;

    let outcome = result?;
    if outcome.stop_reason == StopReason::RoundLimit {
        eprintln!(
            "note: stopped after {} rounds; the answer may be incomplete",
            outcome.rounds
        );
    }
    if let Some(usage) = outcome.usage {
        info!(
            input = usage.input,
            output = usage.output,
            total = usage.total,
            "token usage"
        );
    }
    println!("{}", outcome.text);
    Ok(())
}

fn print_progress(event: &ProgressEvent, json: bool) {
    let line = if json {
        match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to encode progress event: {e}");
                return;
            }
        }
    } else {
        match event {
            ProgressEvent::Status { message } => format!("· {message}"),
            ProgressEvent::AiProcessing { round } => format!("· thinking (round {round})"),
            ProgressEvent::ToolStart { name, .. } => format!("→ {name}"),
            ProgressEvent::ToolComplete {
                name, duration_ms, ..
            } => format!("✓ {name} ({duration_ms} ms)"),
            ProgressEvent::ToolError { name, error, .. } => format!("✗ {name}: {error}"),
            ProgressEvent::TokenUsage { cumulative, .. } => {
                format!("· {} tokens so far", cumulative.total)
            }
        }
    };
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{line}");
}

async fn check(config: &AppConfig) -> Result<()> {
    let store = app::open_store(&config.store)?;
    let runtime = app::build_runtime(config, store)?;
    if runtime.provider_ids().is_empty() {
        bail!("no LLM provider configured; add one under `llm` in the config file");
    }

    let mut healthy = true;
    for (id, ok) in runtime.health_check_all().await {
        println!("{id}: {}", if ok { "ok" } else { "unreachable" });
        healthy &= ok;
    }
    println!("tools: {}", runtime.tools().len());

    if !healthy {
        bail!("one or more providers failed the health check");
    }
    Ok(())
}
