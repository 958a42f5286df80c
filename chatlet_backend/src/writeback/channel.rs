use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::WriteBackError;
use crate::host::HostControls;

/// Where formatted write-backs go.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn submit(&self, text: &str) -> Result<(), WriteBackError>;
}

/// Types into the host's input box and presses send.
pub struct HostInputChannel<H: HostControls> {
    host: Arc<H>,
    click_delay: Duration,
}

impl<H: HostControls> HostInputChannel<H> {
    pub fn new(host: Arc<H>, click_delay: Duration) -> Self {
        Self { host, click_delay }
    }

    fn check_controls(&self) -> Result<(), WriteBackError> {
        if !self.host.input_available() {
            return Err(WriteBackError::ControlsMissing);
        }
        if !self.host.send_enabled() {
            return Err(WriteBackError::SendDisabled);
        }
        Ok(())
    }
}

#[async_trait]
impl<H: HostControls + 'static> OutboundChannel for HostInputChannel<H> {
    async fn submit(&self, text: &str) -> Result<(), WriteBackError> {
        self.check_controls()?;

        let pending = self.host.pending_input();
        let combined = if pending.trim().is_empty() {
            text.to_string()
        } else {
            format!("{}\n{}", pending.trim_end(), text)
        };
        self.host.set_pending_input(combined);

        // Give the host a moment to pick up the new input before clicking.
        if !self.click_delay.is_zero() {
            tokio::time::sleep(self.click_delay).await;
        }

        // The host may have started generating while we waited.
        self.check_controls()?;
        self.host.trigger_send()
    }
}

/// Captures submitted text instead of sending it.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<String>>>,
    rejecting: Arc<AtomicBool>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every submit fails as if the send button were disabled.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl OutboundChannel for RecordingChannel {
    async fn submit(&self, text: &str) -> Result<(), WriteBackError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(WriteBackError::SendDisabled);
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_log::{ChatLogSource, InMemoryChatLog};
    use crate::host::InMemoryHost;

    #[tokio::test]
    async fn submit_appends_to_pending_input_and_sends() {
        let host = Arc::new(InMemoryHost::new(InMemoryChatLog::new()));
        host.set_pending_input("先说一句".to_string());
        let channel = HostInputChannel::new(host.clone(), Duration::from_millis(0));

        channel.submit("[接受任务|T1]").await.unwrap();

        let messages = host.log().get_all_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "先说一句\n[接受任务|T1]");
        assert_eq!(host.pending_input(), "");
    }

    #[tokio::test]
    async fn missing_controls_fail_without_side_effects() {
        let host = Arc::new(InMemoryHost::new(InMemoryChatLog::new()));
        host.set_controls_loaded(false);
        let channel = HostInputChannel::new(host.clone(), Duration::from_millis(0));

        assert_eq!(
            channel.submit("x").await,
            Err(WriteBackError::ControlsMissing)
        );
        assert_eq!(host.pending_input(), "");
        assert_eq!(host.log().get_message_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_disabled_during_the_click_delay_is_reported() {
        let host = Arc::new(InMemoryHost::new(InMemoryChatLog::new()));
        let channel = HostInputChannel::new(host.clone(), Duration::from_millis(200));

        let disabler = {
            let host = host.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                host.set_send_enabled(false);
            })
        };

        assert_eq!(channel.submit("x").await, Err(WriteBackError::SendDisabled));
        disabler.await.unwrap();
        assert_eq!(host.log().get_message_count(), 0);
    }

    #[tokio::test]
    async fn recording_channel_captures_text() {
        let channel = RecordingChannel::new();
        channel.submit("a").await.unwrap();
        channel.set_rejecting(true);
        assert!(channel.submit("b").await.is_err());
        assert_eq!(channel.sent(), vec!["a"]);
    }
}
