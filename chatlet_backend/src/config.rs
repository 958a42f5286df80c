use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::grammar::{TokenGrammar, DEFAULT_THINKING_MARKERS};
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingMarker {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// New messages since the last scan that skip the debounce. 0 disables.
    #[serde(default = "default_message_threshold")]
    pub message_threshold: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_message_threshold() -> usize {
    3
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            message_threshold: default_message_threshold(),
        }
    }
}

impl WidgetSettings {
    fn with_poll(poll_interval_ms: u64) -> Self {
        Self {
            poll_interval_ms,
            ..Self::default()
        }
    }
}

fn default_backpack() -> WidgetSettings {
    WidgetSettings::with_poll(3000)
}

fn default_shop() -> WidgetSettings {
    WidgetSettings::with_poll(5000)
}

fn default_tasks() -> WidgetSettings {
    WidgetSettings::with_poll(4000)
}

fn default_contacts() -> WidgetSettings {
    WidgetSettings::with_poll(8000)
}

fn default_forum() -> WidgetSettings {
    WidgetSettings {
        poll_interval_ms: 3000,
        debounce_ms: 800,
        ..WidgetSettings::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name used as the actor in write-back sentences and forum posts.
    #[serde(default = "default_user_name")]
    pub user_name: String,

    /// JSON-lines transcript the simulator loads and saves.
    #[serde(default)]
    pub transcript_path: Option<String>,

    #[serde(default = "default_thinking_markers")]
    pub thinking_markers: Vec<ThinkingMarker>,

    // Write-back
    #[serde(default = "default_click_delay_ms")]
    pub click_delay_ms: u64,

    // Scheduler safety net
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,

    #[serde(default = "default_backpack")]
    pub backpack: WidgetSettings,
    #[serde(default = "default_shop")]
    pub shop: WidgetSettings,
    #[serde(default = "default_tasks")]
    pub tasks: WidgetSettings,
    #[serde(default = "default_contacts")]
    pub contacts: WidgetSettings,
    #[serde(default = "default_forum")]
    pub forum: WidgetSettings,
}

fn default_user_name() -> String {
    "我".to_string()
}

fn default_thinking_markers() -> Vec<ThinkingMarker> {
    DEFAULT_THINKING_MARKERS
        .iter()
        .map(|(start, end)| ThinkingMarker {
            start: start.to_string(),
            end: end.to_string(),
        })
        .collect()
}

fn default_click_delay_ms() -> u64 {
    300
}

fn default_stuck_timeout_secs() -> u64 {
    30
}

fn default_health_check_secs() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_name: default_user_name(),
            transcript_path: None,
            thinking_markers: default_thinking_markers(),
            click_delay_ms: default_click_delay_ms(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
            health_check_secs: default_health_check_secs(),
            backpack: default_backpack(),
            shop: default_shop(),
            tasks: default_tasks(),
            contacts: default_contacts(),
            forum: default_forum(),
        }
    }
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("chatlet_config.toml")
    }

    /// Load config from chatlet_config.toml (next to executable)
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                if path.exists() {
                    tracing::error!("{:#}", e);
                }
                tracing::warn!("No usable config file, using defaults + env vars");
                Self::from_env()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults overlaid with environment variables. The interval,
    /// debounce and threshold variables apply to every widget.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = env::var("CHATLET_USER_NAME") {
            if !name.trim().is_empty() {
                config.user_name = name;
            }
        }

        if let Ok(path) = env::var("CHATLET_TRANSCRIPT") {
            if !path.trim().is_empty() {
                config.transcript_path = Some(path);
            }
        }

        if let Ok(interval) = env::var("CHATLET_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                config.widgets_mut().for_each(|w| w.poll_interval_ms = ms);
            }
        }

        if let Ok(debounce) = env::var("CHATLET_DEBOUNCE_MS") {
            if let Ok(ms) = debounce.parse() {
                config.widgets_mut().for_each(|w| w.debounce_ms = ms);
            }
        }

        if let Ok(threshold) = env::var("CHATLET_MESSAGE_THRESHOLD") {
            if let Ok(count) = threshold.parse() {
                config.widgets_mut().for_each(|w| w.message_threshold = count);
            }
        }

        config
    }

    fn widgets_mut(&mut self) -> impl Iterator<Item = &mut WidgetSettings> {
        [
            &mut self.backpack,
            &mut self.shop,
            &mut self.tasks,
            &mut self.contacts,
            &mut self.forum,
        ]
        .into_iter()
    }

    pub fn grammar(&self) -> Result<TokenGrammar> {
        TokenGrammar::new(
            self.thinking_markers
                .iter()
                .map(|m| (m.start.clone(), m.end.clone())),
        )
    }

    pub fn click_delay(&self) -> Duration {
        Duration::from_millis(self.click_delay_ms)
    }

    pub fn scheduler_config(&self, widget: &WidgetSettings) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(widget.poll_interval_ms),
            debounce: Duration::from_millis(widget.debounce_ms),
            message_threshold: widget.message_threshold,
            stuck_timeout: Duration::from_secs(self.stuck_timeout_secs),
            health_check_interval: Duration::from_secs(self.health_check_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
user_name = "旅人"

[forum]
poll_interval_ms = 2000
"#,
        )
        .unwrap();

        assert_eq!(config.user_name, "旅人");
        assert_eq!(config.forum.poll_interval_ms, 2000);
        assert_eq!(config.forum.debounce_ms, 500);
        assert!(config.shop.enabled);
        assert_eq!(config.thinking_markers.len(), 2);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatlet_config.toml");

        let mut config = EngineConfig::default();
        config.contacts.enabled = false;
        config.transcript_path = Some("chat.jsonl".to_string());
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert!(!loaded.contacts.enabled);
        assert_eq!(loaded.transcript_path.as_deref(), Some("chat.jsonl"));
        assert_eq!(loaded.backpack, config.backpack);
    }

    #[test]
    fn scheduler_settings_follow_the_widget() {
        let config = EngineConfig::default();
        let scheduler = config.scheduler_config(&config.forum);
        assert_eq!(scheduler.poll_interval, Duration::from_millis(3000));
        assert_eq!(scheduler.debounce, Duration::from_millis(800));
        assert_eq!(scheduler.stuck_timeout, Duration::from_secs(30));
    }

    #[test]
    fn grammar_uses_configured_markers() {
        let mut config = EngineConfig::default();
        config.thinking_markers = vec![ThinkingMarker {
            start: "<内心>".to_string(),
            end: "</内心>".to_string(),
        }];
        let grammar = config.grammar().unwrap();
        assert_eq!(grammar.strip_thinking("a<内心>b</内心>c"), "ac");
    }
}
