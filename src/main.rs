mod commands;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use chatlet_backend::chat_log::{read_transcript, write_transcript, ChatLogSource, InMemoryChatLog};
use chatlet_backend::config::EngineConfig;
use chatlet_backend::host::{HostControls, HostEvent, InMemoryHost};
use chatlet_backend::runtime::WidgetRuntime;
use chatlet_backend::widgets::WidgetEvent;

use commands::Command;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatlet_backend=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Chatlet host simulator starting...");

    let config = EngineConfig::load();
    let transcript = std::env::args()
        .nth(1)
        .or_else(|| config.transcript_path.clone())
        .map(PathBuf::from);

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(run(config, transcript))
}

async fn run(config: EngineConfig, transcript: Option<PathBuf>) -> Result<()> {
    let messages = match &transcript {
        Some(path) if path.exists() => read_transcript(path)?,
        Some(path) => {
            tracing::info!("{:?} does not exist yet, starting an empty chat", path);
            Vec::new()
        }
        None => Vec::new(),
    };
    tracing::info!("Loaded {} message(s)", messages.len());

    let host = Arc::new(InMemoryHost::new(InMemoryChatLog::from_messages(messages)));
    let (event_tx, event_rx) = flume::unbounded();
    let runtime = WidgetRuntime::for_host(config, host.clone(), event_tx)
        .context("failed to build widget runtime")?;

    let printer = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                WidgetEvent::SnapshotChanged {
                    widget,
                    entity_count,
                    change,
                } => println!("~ {} updated: {} entities ({})", widget, entity_count, change),
            }
        }
    });

    runtime.start_all();
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("! {:#}", e);
                continue;
            }
        };
        match handle(&command, &runtime, &host).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {:#}", e),
        }
    }

    runtime.stop_all();
    printer.abort();

    if let Some(path) = &transcript {
        save(path, &host)?;
    }
    Ok(())
}

/// Returns false when the session should end.
async fn handle(command: &Command, runtime: &WidgetRuntime, host: &InMemoryHost) -> Result<bool> {
    match command {
        Command::Receive(text) => host.receive(text.clone()),
        Command::Send(text) => {
            host.set_pending_input(text.clone());
            host.trigger_send()?;
        }
        Command::Show(widget) => show(runtime, widget.as_deref())?,
        Command::Switch => host.events().emit(HostEvent::ChatChanged),
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => return Ok(false),
        _ => {
            // Snapshots may lag the timers; act on what is in the log now.
            runtime.refresh_all();
            if let Some(action) = commands::resolve(command, runtime)? {
                let write_back = runtime.perform(&action).await?;
                println!("> {}", write_back.text);
            }
        }
    }
    Ok(true)
}

fn show(runtime: &WidgetRuntime, widget: Option<&str>) -> Result<()> {
    runtime.refresh_all();
    let all = ["backpack", "shop", "tasks", "contacts", "forum"];
    let selected: Vec<&str> = match widget {
        Some(name) if all.contains(&name) => vec![name],
        Some(name) => anyhow::bail!("unknown widget '{}'", name),
        None => all.to_vec(),
    };

    for name in selected {
        let value = match name {
            "backpack" => serde_json::to_value(&*runtime.backpack.snapshot()),
            "shop" => serde_json::to_value(&*runtime.shop.snapshot()),
            "tasks" => serde_json::to_value(&*runtime.tasks.snapshot()),
            "contacts" => serde_json::to_value(&*runtime.contacts.snapshot()),
            _ => serde_json::to_value(&*runtime.forum.snapshot()),
        }
        .context("failed to serialize snapshot")?;
        println!("[{}]\n{}", name, serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn save(path: &Path, host: &InMemoryHost) -> Result<()> {
    let messages = host
        .log()
        .read_messages()
        .context("chat log unavailable at shutdown")?;
    write_transcript(path, &messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_writes_the_live_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.jsonl");
        let host = InMemoryHost::new(InMemoryChatLog::new());
        host.receive("[背包|药水|药品|恢复50HP|3]");
        host.set_pending_input("谢谢".to_string());
        host.trigger_send().unwrap();

        save(&path, &host).unwrap();

        let saved = read_transcript(&path).unwrap();
        assert_eq!(saved.len(), 2);
        assert!(saved[1].is_user);
    }
}
