//! The host chat application as seen by the widgets: a lifecycle event
//! stream and a textbox + send button pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::chat_log::{ChatMessage, InMemoryChatLog};
use crate::error::WriteBackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    MessageSent,
    MessageReceived,
    MessageEdited,
    ChatChanged,
    /// High-frequency input activity (typing, streaming updates).
    InputChanged,
}

/// Fan-out of host lifecycle events; every scheduler holds its own
/// subscription.
#[derive(Clone)]
pub struct HostEventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl HostEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: HostEvent) {
        // No subscribers is normal before any widget starts.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}

impl Default for HostEventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// The host's message input element and send trigger.
pub trait HostControls: Send + Sync {
    /// False until the host has rendered its input area.
    fn input_available(&self) -> bool;

    fn send_enabled(&self) -> bool;

    fn pending_input(&self) -> String;

    fn set_pending_input(&self, text: String);

    fn trigger_send(&self) -> Result<(), WriteBackError>;
}

/// A self-contained host: chat log, input buffer and event bus. Sending
/// moves the input buffer into the log as a user message.
pub struct InMemoryHost {
    log: InMemoryChatLog,
    events: HostEventBus,
    input: Mutex<String>,
    controls_loaded: AtomicBool,
    send_enabled: AtomicBool,
}

impl InMemoryHost {
    pub fn new(log: InMemoryChatLog) -> Self {
        Self {
            log,
            events: HostEventBus::default(),
            input: Mutex::new(String::new()),
            controls_loaded: AtomicBool::new(true),
            send_enabled: AtomicBool::new(true),
        }
    }

    pub fn log(&self) -> &InMemoryChatLog {
        &self.log
    }

    pub fn events(&self) -> &HostEventBus {
        &self.events
    }

    /// A message produced on the other side of the chat.
    pub fn receive(&self, text: impl Into<String>) {
        self.log.push(ChatMessage::from_host(text));
        self.events.emit(HostEvent::MessageReceived);
    }

    pub fn set_controls_loaded(&self, loaded: bool) {
        self.controls_loaded.store(loaded, Ordering::SeqCst);
    }

    pub fn set_send_enabled(&self, enabled: bool) {
        self.send_enabled.store(enabled, Ordering::SeqCst);
    }
}

impl HostControls for InMemoryHost {
    fn input_available(&self) -> bool {
        self.controls_loaded.load(Ordering::SeqCst)
    }

    fn send_enabled(&self) -> bool {
        self.send_enabled.load(Ordering::SeqCst)
    }

    fn pending_input(&self) -> String {
        self.input.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_pending_input(&self, text: String) {
        *self.input.lock().unwrap_or_else(|e| e.into_inner()) = text;
    }

    fn trigger_send(&self) -> Result<(), WriteBackError> {
        if !self.input_available() {
            return Err(WriteBackError::ControlsMissing);
        }
        if !self.send_enabled() {
            return Err(WriteBackError::SendDisabled);
        }
        let text = std::mem::take(&mut *self.input.lock().unwrap_or_else(|e| e.into_inner()));
        if text.trim().is_empty() {
            return Err(WriteBackError::Host("input is empty".to_string()));
        }
        self.log.push(ChatMessage::from_user(text));
        self.events.emit(HostEvent::MessageSent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_log::ChatLogSource;

    #[test]
    fn send_moves_input_into_the_log() {
        let host = InMemoryHost::new(InMemoryChatLog::new());
        let mut events = host.events().subscribe();

        host.set_pending_input("你好".to_string());
        host.trigger_send().unwrap();

        assert_eq!(host.pending_input(), "");
        let messages = host.log().get_all_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_user);
        assert_eq!(events.try_recv().unwrap(), HostEvent::MessageSent);
    }

    #[test]
    fn disabled_send_keeps_the_input() {
        let host = InMemoryHost::new(InMemoryChatLog::new());
        host.set_send_enabled(false);
        host.set_pending_input("稍等".to_string());

        assert_eq!(host.trigger_send(), Err(WriteBackError::SendDisabled));
        assert_eq!(host.pending_input(), "稍等");
        assert_eq!(host.log().get_message_count(), 0);
    }
}
