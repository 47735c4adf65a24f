//! Pilot 命令行入口
//!
//! 每行输入处理一轮对话：进度事件写到 stderr，最终回复写到 stdout；
//! 待确认的写操作逐条询问 y/N。可选参数为配置文件路径。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;

use pilot::config::{load_config, AppConfig};
use pilot::core::{AgentBuilder, Orchestrator, TurnRequest};
use pilot::react::{ProgressEvent, ProgressKind};
use pilot::tools::{TaskBoard, ToolRegistry};

const SESSION_ID: &str = "cli";
const USER_ID: &str = "local";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pilot::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let board = TaskBoard::with_tasks(&[
        ("Write the quarterly report", "in_progress"),
        ("Renew passport", "to_do"),
        ("Book dentist appointment", "done"),
    ])
    .await;
    let mut registry = ToolRegistry::new();
    board.register_tools(&mut registry);

    let orchestrator = Arc::new(AgentBuilder::new(config).with_registry(registry).build());

    let mut events = orchestrator.streamer().subscribe_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = render_event(&event) {
                eprintln!("  · {line}");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"pilot ready. Type a request, or Ctrl-D to quit.\n> ").await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let text = line.trim();
        if text.is_empty() {
            prompt(&mut stdout).await?;
            continue;
        }

        let cancel = CancellationToken::new();
        let result = orchestrator
            .process_turn(TurnRequest::new(SESSION_ID, USER_ID, text), &cancel)
            .await;
        stdout.write_all(format!("{}\n", result.message).as_bytes()).await?;

        for action in result.pending_actions() {
            stdout
                .write_all(format!("Run \"{}\"? [y/N] ", action.description).as_bytes())
                .await?;
            stdout.flush().await?;
            let approved = confirm(&mut lines).await?;
            let reply = resolve(&orchestrator, &action.id, approved, &cancel).await;
            stdout.write_all(format!("{reply}\n").as_bytes()).await?;
        }
        prompt(&mut stdout).await?;
    }
    Ok(())
}

async fn prompt(stdout: &mut tokio::io::Stdout) -> anyhow::Result<()> {
    stdout.write_all(b"> ").await?;
    stdout.flush().await?;
    Ok(())
}

async fn confirm(lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<bool> {
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn resolve(orchestrator: &Orchestrator, action_id: &str, approved: bool, cancel: &CancellationToken) -> String {
    let outcome = if approved {
        orchestrator.confirm_action(USER_ID, action_id, cancel).await
    } else {
        orchestrator.decline_action(USER_ID, action_id).await
    };
    match outcome {
        Ok(result) => result.message.into_string(),
        Err(e) => format!("Could not resolve action: {e}"),
    }
}

fn render_event(event: &ProgressEvent) -> Option<String> {
    match &event.kind {
        ProgressKind::Plan { goal, steps } => Some(format!("plan \"{goal}\" ({} steps)", steps.len())),
        ProgressKind::StepStart { description, .. } => Some(format!("start: {description}")),
        ProgressKind::StepComplete { tool, cached, duration_ms, .. } => Some(format!(
            "done: {} ({duration_ms}ms{})",
            tool.as_deref().unwrap_or("step"),
            if *cached { ", cached" } else { "" }
        )),
        ProgressKind::StepFailed { error, .. } => Some(format!("failed: {error}")),
        ProgressKind::Thinking { text } => Some(text.clone()),
        ProgressKind::Error { code, message } => Some(format!("error [{code}]: {message}")),
        ProgressKind::Complete { .. } => None,
    }
}
