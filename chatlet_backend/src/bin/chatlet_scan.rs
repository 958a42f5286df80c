use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chatlet_backend::chat_log::{read_transcript, ChatLogSource, InMemoryChatLog};
use chatlet_backend::config::EngineConfig;
use chatlet_backend::domain::backpack::Backpack;
use chatlet_backend::domain::contacts::Contacts;
use chatlet_backend::domain::forum::Forum;
use chatlet_backend::domain::shop::Shop;
use chatlet_backend::domain::tasks::TaskBoard;
use chatlet_backend::domain::ReconcilingExtractor;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// One-shot scan: print every widget's snapshot of a transcript as JSON.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,chatlet_backend=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::load();
    let path = match std::env::args().nth(1).or(config.transcript_path.clone()) {
        Some(path) => PathBuf::from(path),
        None => bail!("usage: chatlet_scan <transcript.jsonl> (or set CHATLET_TRANSCRIPT)"),
    };

    let log = InMemoryChatLog::from_messages(read_transcript(&path)?);
    let messages = log.get_all_messages();
    let grammar = Arc::new(config.grammar()?);
    tracing::info!("Scanning {} message(s) from {:?}", messages.len(), path);

    let report = json!({
        "backpack": ReconcilingExtractor::new(grammar.clone(), Backpack).extract_messages(&messages),
        "shop": ReconcilingExtractor::new(grammar.clone(), Shop).extract_messages(&messages),
        "tasks": ReconcilingExtractor::new(grammar.clone(), TaskBoard).extract_messages(&messages),
        "contacts": ReconcilingExtractor::new(grammar.clone(), Contacts).extract_messages(&messages),
        "forum": ReconcilingExtractor::new(grammar, Forum).extract_messages(&messages),
    });

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render snapshot report")?
    );
    Ok(())
}
