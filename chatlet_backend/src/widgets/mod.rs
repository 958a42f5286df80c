use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::chat_log::ChatLogSource;
use crate::detector::{Change, ChangeDetector};
use crate::domain::{Domain, ReconcilingExtractor, Snapshot};
use crate::grammar::TokenGrammar;
use crate::scheduler::{ScanOutcome, ScanTarget};

/// An event produced by a widget after a scan
#[derive(Debug, Clone)]
pub enum WidgetEvent {
    /// The widget's snapshot differs from the one last rendered
    SnapshotChanged {
        /// Widget name (e.g. "backpack", "forum")
        widget: String,
        /// Number of entities in the new snapshot
        entity_count: usize,
        /// What the detector saw
        change: Change,
    },
}

/// One mini-app: reads the shared chat log, keeps its last snapshot and
/// reports changes. Each widget owns its detector, so two widgets over the
/// same log never interfere.
pub struct Widget<D: Domain> {
    extractor: ReconcilingExtractor<D>,
    source: Arc<dyn ChatLogSource>,
    detector: Mutex<ChangeDetector<D::Entity>>,
    snapshot: RwLock<Arc<Snapshot<D::Entity>>>,
    events: Option<flume::Sender<WidgetEvent>>,
}

impl<D: Domain> Widget<D> {
    pub fn new(grammar: Arc<TokenGrammar>, domain: D, source: Arc<dyn ChatLogSource>) -> Self {
        Self {
            extractor: ReconcilingExtractor::new(grammar, domain),
            source,
            detector: Mutex::new(ChangeDetector::new()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            events: None,
        }
    }

    pub fn with_events(mut self, events: flume::Sender<WidgetEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn domain(&self) -> &D {
        self.extractor.domain()
    }

    /// Last snapshot that was reported as changed.
    pub fn snapshot(&self) -> Arc<Snapshot<D::Entity>> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Forget the rendered snapshot so the next scan reports a change.
    pub fn invalidate(&self) {
        self.detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }

    /// Synchronous scan body shared by the scheduler and direct callers.
    /// The detector lock is held from the read to the snapshot store, so
    /// concurrent refreshes apply in the order they read the log.
    pub fn refresh(&self) -> Change {
        let name = self.domain().name();
        let mut detector = self.detector.lock().unwrap_or_else(|e| e.into_inner());
        let messages = match self.source.read_messages() {
            Ok(messages) => messages,
            Err(e) => {
                // Treat as "nothing new" rather than an empty snapshot.
                tracing::debug!("[{}] {}, skipping scan", name, e);
                return Change::Unchanged;
            }
        };

        let current = self.extractor.extract_messages(&messages);
        let change = detector.observe(&current);

        if change.is_changed() {
            let entity_count = current.len();
            *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(current);
            drop(detector);
            tracing::debug!("[{}] {} ({} entities)", name, change, entity_count);
            self.emit(WidgetEvent::SnapshotChanged {
                widget: name.to_string(),
                entity_count,
                change,
            });
        }
        change
    }

    fn emit(&self, event: WidgetEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                tracing::trace!("[{}] no widget event listener", self.domain().name());
            }
        }
    }
}

#[async_trait]
impl<D: Domain> ScanTarget for Widget<D> {
    fn name(&self) -> &str {
        self.domain().name()
    }

    fn message_count(&self) -> usize {
        self.source.get_message_count()
    }

    async fn scan(&self) -> Result<ScanOutcome> {
        Ok(if self.refresh().is_changed() {
            ScanOutcome::Changed
        } else {
            ScanOutcome::Unchanged
        })
    }
}
