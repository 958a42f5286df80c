//! Read access to the host's append-only chat log.
//!
//! Sources are re-read on every scan; entity state is always rebuilt by
//! replaying the whole log, so nothing here caches.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::grammar::TokenGrammar;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    #[serde(default)]
    pub is_user: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn from_user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_user: true,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn from_host(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_user: false,
            timestamp: Some(Utc::now()),
        }
    }
}

pub trait ChatLogSource: Send + Sync {
    /// The full live log, or an error while the host is not loaded.
    fn read_messages(&self) -> Result<Vec<ChatMessage>, SourceError>;

    fn read_count(&self) -> Result<usize, SourceError> {
        self.read_messages().map(|messages| messages.len())
    }

    /// All messages; an unavailable host reads as an empty log.
    fn get_all_messages(&self) -> Vec<ChatMessage> {
        self.read_messages().unwrap_or_else(|e| {
            tracing::debug!("{}", e);
            Vec::new()
        })
    }

    fn get_message_count(&self) -> usize {
        self.read_count().unwrap_or(0)
    }

    fn messages_since(&self, index: usize) -> Vec<ChatMessage> {
        self.get_all_messages().into_iter().skip(index).collect()
    }

    fn all_text(&self, grammar: &TokenGrammar) -> String {
        concatenate(&self.get_all_messages(), grammar)
    }
}

/// A log that can rewrite text it already holds. Used to patch the local
/// copy right after a write-back, before the host persists anything.
pub trait PatchableLog: Send + Sync {
    /// Apply `patch` to every message before index `upto`; returns how many
    /// messages changed.
    fn patch_messages(
        &self,
        upto: usize,
        patch: &mut dyn FnMut(&str) -> Option<String>,
    ) -> Result<usize, SourceError>;
}

/// Join messages with newlines after stripping thinking spans from each one
/// individually, so an unclosed span never swallows later messages.
pub fn concatenate(messages: &[ChatMessage], grammar: &TokenGrammar) -> String {
    messages
        .iter()
        .map(|message| grammar.strip_thinking(&message.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Shared in-memory log. Clones share the same storage.
#[derive(Clone, Default)]
pub struct InMemoryChatLog {
    messages: Arc<RwLock<Vec<ChatMessage>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages: Arc::new(RwLock::new(messages)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn push(&self, message: ChatMessage) {
        self.messages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    /// Simulate the host not having loaded its chat yet.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

impl ChatLogSource for InMemoryChatLog {
    fn read_messages(&self) -> Result<Vec<ChatMessage>, SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("chat not loaded".to_string()));
        }
        Ok(self
            .messages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn read_count(&self) -> Result<usize, SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("chat not loaded".to_string()));
        }
        Ok(self.messages.read().unwrap_or_else(|e| e.into_inner()).len())
    }
}

impl PatchableLog for InMemoryChatLog {
    fn patch_messages(
        &self,
        upto: usize,
        patch: &mut dyn FnMut(&str) -> Option<String>,
    ) -> Result<usize, SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("chat not loaded".to_string()));
        }
        let mut messages = self.messages.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for message in messages.iter_mut().take(upto) {
            if let Some(text) = patch(&message.text) {
                message.text = text;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

/// Read a JSON-lines transcript. Blank lines are ignored; a line that is
/// not a message object is kept as plain host text.
pub fn read_transcript(path: &Path) -> Result<Vec<ChatMessage>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read transcript {:?}", path))?;

    let messages = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<ChatMessage>(line).unwrap_or_else(|_| ChatMessage {
                text: line.to_string(),
                is_user: false,
                timestamp: None,
            })
        })
        .collect();
    Ok(messages)
}

pub fn write_transcript(path: &Path, messages: &[ChatMessage]) -> Result<()> {
    let mut out = String::new();
    for message in messages {
        out.push_str(&serde_json::to_string(message).context("Failed to serialize message")?);
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("Failed to write transcript {:?}", path))?;
    tracing::info!("Saved {} message(s) to {:?}", messages.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_source_reads_as_empty() {
        let log = InMemoryChatLog::from_messages(vec![ChatMessage::from_host("hi")]);
        log.set_available(false);

        assert!(log.read_messages().is_err());
        assert!(log.get_all_messages().is_empty());
        assert_eq!(log.get_message_count(), 0);

        log.set_available(true);
        assert_eq!(log.get_message_count(), 1);
    }

    #[test]
    fn messages_since_skips_the_prefix() {
        let log = InMemoryChatLog::new();
        for text in ["a", "b", "c"] {
            log.push(ChatMessage::from_host(text));
        }
        let tail: Vec<String> = log.messages_since(1).into_iter().map(|m| m.text).collect();
        assert_eq!(tail, vec!["b", "c"]);
        assert!(log.messages_since(5).is_empty());
    }

    #[test]
    fn unclosed_thinking_is_contained_to_its_message() {
        let grammar = TokenGrammar::standard().unwrap();
        let log = InMemoryChatLog::from_messages(vec![
            ChatMessage::from_host("<thinking>还没想完"),
            ChatMessage::from_host("[背包|面包|食品|香|2]"),
        ]);
        assert_eq!(log.all_text(&grammar), "\n[背包|面包|食品|香|2]");
    }

    #[test]
    fn patching_stops_at_the_limit() {
        let log = InMemoryChatLog::from_messages(vec![
            ChatMessage::from_host("x"),
            ChatMessage::from_host("x"),
        ]);
        let changed = log
            .patch_messages(1, &mut |text| Some(format!("{}!", text)))
            .unwrap();
        assert_eq!(changed, 1);
        let texts: Vec<String> = log.get_all_messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["x!", "x"]);
    }

    #[test]
    fn transcript_round_trip_tolerates_plain_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.jsonl");
        fs::write(&path, "{\"text\":\"你好\",\"is_user\":true}\n\n纯文本[背包|a|b|c|1]\n").unwrap();

        let messages = read_transcript(&path).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_user);
        assert_eq!(messages[1].text, "纯文本[背包|a|b|c|1]");

        write_transcript(&path, &messages).unwrap();
        assert_eq!(read_transcript(&path).unwrap(), messages);
    }
}
