use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::chat_log::{ChatLogSource, PatchableLog};
use crate::config::{EngineConfig, WidgetSettings};
use crate::domain::backpack::Backpack;
use crate::domain::contacts::Contacts;
use crate::domain::forum::{next_thread_id, Forum};
use crate::domain::shop::Shop;
use crate::domain::tasks::TaskBoard;
use crate::domain::Domain;
use crate::grammar::TokenGrammar;
use crate::host::{HostEventBus, InMemoryHost};
use crate::scheduler::{PollingScheduler, ScanTarget};
use crate::widgets::{Widget, WidgetEvent};
use crate::writeback::{
    HostInputChannel, OutboundChannel, WriteAction, WriteBack, WriteBackFormatter,
    WriteBackService,
};

/// Every widget over one chat log, their schedulers and the write-back
/// path back into the host.
pub struct WidgetRuntime {
    pub config: EngineConfig,
    pub grammar: Arc<TokenGrammar>,
    pub backpack: Arc<Widget<Backpack>>,
    pub shop: Arc<Widget<Shop>>,
    pub tasks: Arc<Widget<TaskBoard>>,
    pub contacts: Arc<Widget<Contacts>>,
    pub forum: Arc<Widget<Forum>>,
    schedulers: Vec<PollingScheduler>,
    writeback: WriteBackService,
}

pub struct WidgetRuntimeBuilder {
    config: EngineConfig,
    source: Arc<dyn ChatLogSource>,
    log: Arc<dyn PatchableLog>,
    channel: Arc<dyn OutboundChannel>,
    host_events: Option<HostEventBus>,
    event_tx: Option<Sender<WidgetEvent>>,
}

impl WidgetRuntimeBuilder {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn ChatLogSource>,
        log: Arc<dyn PatchableLog>,
        channel: Arc<dyn OutboundChannel>,
    ) -> Self {
        Self {
            config,
            source,
            log,
            channel,
            host_events: None,
            event_tx: None,
        }
    }

    pub fn with_host_events(mut self, bus: HostEventBus) -> Self {
        self.host_events = Some(bus);
        self
    }

    pub fn with_event_sender(mut self, event_tx: Sender<WidgetEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn build(self) -> Result<WidgetRuntime> {
        let config = self.config;
        let grammar = Arc::new(config.grammar().context("Failed to build token grammar")?);

        let backpack = build_widget(&grammar, Backpack, &self.source, &self.event_tx);
        let shop = build_widget(&grammar, Shop, &self.source, &self.event_tx);
        let tasks = build_widget(&grammar, TaskBoard, &self.source, &self.event_tx);
        let contacts = build_widget(&grammar, Contacts, &self.source, &self.event_tx);
        let forum = build_widget(&grammar, Forum, &self.source, &self.event_tx);

        let targets: [(Arc<dyn ScanTarget>, &WidgetSettings); 5] = [
            (backpack.clone(), &config.backpack),
            (shop.clone(), &config.shop),
            (tasks.clone(), &config.tasks),
            (contacts.clone(), &config.contacts),
            (forum.clone(), &config.forum),
        ];
        let mut schedulers = Vec::new();
        for (target, settings) in targets {
            if !settings.enabled {
                tracing::info!("Widget '{}' disabled", target.name());
                continue;
            }
            let scheduler = PollingScheduler::new(target, config.scheduler_config(settings));
            schedulers.push(match &self.host_events {
                Some(bus) => scheduler.with_events(bus.clone()),
                None => scheduler,
            });
        }

        let writeback = WriteBackService::new(
            WriteBackFormatter::new(config.user_name.clone()),
            grammar.clone(),
            self.source.clone(),
            self.log,
            self.channel,
        );

        tracing::info!(
            "Widget runtime ready ({} of 5 widgets scheduled)",
            schedulers.len()
        );

        Ok(WidgetRuntime {
            config,
            grammar,
            backpack,
            shop,
            tasks,
            contacts,
            forum,
            schedulers,
            writeback,
        })
    }
}

fn build_widget<D: Domain>(
    grammar: &Arc<TokenGrammar>,
    domain: D,
    source: &Arc<dyn ChatLogSource>,
    event_tx: &Option<Sender<WidgetEvent>>,
) -> Arc<Widget<D>> {
    let widget = Widget::new(grammar.clone(), domain, source.clone());
    Arc::new(match event_tx {
        Some(tx) => widget.with_events(tx.clone()),
        None => widget,
    })
}

impl WidgetRuntime {
    /// Wire every widget to an [`InMemoryHost`]: its log is the source, its
    /// input box is the outbound channel and its event bus drives scans.
    pub fn for_host(
        config: EngineConfig,
        host: Arc<InMemoryHost>,
        event_tx: Sender<WidgetEvent>,
    ) -> Result<Self> {
        let log = Arc::new(host.log().clone());
        let channel = Arc::new(HostInputChannel::new(host.clone(), config.click_delay()));
        WidgetRuntimeBuilder::new(config, log.clone(), log, channel)
            .with_host_events(host.events().clone())
            .with_event_sender(event_tx)
            .build()
    }

    /// Must be called inside a tokio runtime.
    pub fn start_all(&self) {
        for scheduler in &self.schedulers {
            scheduler.start();
        }
    }

    pub fn stop_all(&self) {
        for scheduler in &self.schedulers {
            scheduler.stop();
        }
    }

    pub fn schedulers(&self) -> &[PollingScheduler] {
        &self.schedulers
    }

    /// Scan every widget now, on the calling task.
    pub fn refresh_all(&self) {
        self.backpack.refresh();
        self.shop.refresh();
        self.tasks.refresh();
        self.contacts.refresh();
        self.forum.refresh();
    }

    /// Id for a thread the user is about to post.
    pub fn next_thread_id(&self) -> String {
        self.forum.refresh();
        next_thread_id(&self.forum.snapshot())
    }

    pub fn user_name(&self) -> &str {
        self.writeback.formatter().user_name()
    }

    /// Send a write-back, then ask every running scheduler for a rescan so
    /// the widgets pick it up without waiting for their timers.
    pub async fn perform(&self, action: &WriteAction) -> Result<WriteBack> {
        let write_back = self
            .writeback
            .perform(action)
            .await
            .with_context(|| format!("Write-back for {} failed", action_target(action)))?;
        for scheduler in &self.schedulers {
            scheduler.request_scan();
        }
        Ok(write_back)
    }
}

fn action_target(action: &WriteAction) -> &str {
    match action {
        WriteAction::UseItem { .. } | WriteAction::BuyProduct { .. } => Backpack.name(),
        WriteAction::AcceptTask { .. } | WriteAction::CompleteTask { .. } => TaskBoard.name(),
        WriteAction::PostThread { .. }
        | WriteAction::ReplyThread { .. }
        | WriteAction::ReplyFloor { .. } => Forum.name(),
    }
}
