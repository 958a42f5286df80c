//! Polling scheduler shared by every widget.
//!
//! Scans are requested by a fixed-period timer and by host lifecycle
//! events. High-frequency events are coalesced with a trailing-edge
//! debounce unless the host log grew by at least `message_threshold`
//! messages since the last scan, in which case the scan fires at once.
//! At most one scan runs at a time: a request that arrives while one is in
//! flight is dropped, not queued. A periodic health check clears a guard
//! that has been held longer than `stuck_timeout`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::host::{HostEvent, HostEventBus};

const MIN_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Changed,
    Unchanged,
}

/// Something the scheduler can re-scan.
#[async_trait]
pub trait ScanTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Current host message count, compared against the count at the last
    /// scan to decide whether an event skips the debounce.
    fn message_count(&self) -> usize;

    async fn scan(&self) -> Result<ScanOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRequest {
    Started,
    /// Another scan is in flight.
    Dropped,
    /// The scheduler is stopped.
    Inactive,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub debounce: Duration,
    /// 0 disables the immediate path.
    pub message_threshold: usize,
    pub stuck_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            debounce: Duration::from_millis(500),
            message_threshold: 3,
            stuck_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Immediate,
    Debounced,
}

struct Flight {
    active: bool,
    /// Held from spawn until the scan task ends or the health check clears
    /// it. Survives `stop()`, so a restart cannot overlap a live scan.
    in_flight: bool,
    epoch: u64,
    started_at: Option<Instant>,
}

impl Flight {
    fn state(&self) -> SchedulerState {
        match (self.active, self.in_flight) {
            (false, _) => SchedulerState::Idle,
            (true, true) => SchedulerState::Running,
            (true, false) => SchedulerState::Scheduled,
        }
    }
}

struct Shared {
    target: Arc<dyn ScanTarget>,
    config: SchedulerConfig,
    flight: Mutex<Flight>,
    baseline_count: AtomicUsize,
    scans_started: AtomicU64,
}

/// Releases the in-flight guard when a scan task ends, including by panic.
struct FlightGuard {
    shared: Arc<Shared>,
    epoch: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.shared.finish(self.epoch);
    }
}

impl Shared {
    fn flight(&self) -> MutexGuard<'_, Flight> {
        self.flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn request_scan(self: &Arc<Self>, reason: &'static str) -> ScanRequest {
        let epoch = {
            let mut flight = self.flight();
            if !flight.active {
                return ScanRequest::Inactive;
            }
            if flight.in_flight {
                tracing::debug!(
                    "[{}] scan already in flight, dropping {} request",
                    self.target.name(),
                    reason
                );
                return ScanRequest::Dropped;
            }
            flight.in_flight = true;
            flight.epoch += 1;
            flight.started_at = Some(Instant::now());
            flight.epoch
        };

        self.baseline_count
            .store(self.target.message_count(), Ordering::SeqCst);
        self.scans_started.fetch_add(1, Ordering::SeqCst);

        let guard = FlightGuard {
            shared: Arc::clone(self),
            epoch,
        };
        tokio::spawn(async move {
            let target = Arc::clone(&guard.shared.target);
            match target.scan().await {
                Ok(ScanOutcome::Changed) => {
                    tracing::debug!("[{}] scan #{} ({}) found changes", target.name(), epoch, reason)
                }
                Ok(ScanOutcome::Unchanged) => {}
                Err(e) => tracing::error!("[{}] scan failed: {:#}", target.name(), e),
            }
            drop(guard);
        });

        tracing::trace!("[{}] scan #{} started by {}", self.target.name(), epoch, reason);
        ScanRequest::Started
    }

    fn finish(&self, epoch: u64) {
        let mut flight = self.flight();
        if flight.in_flight && flight.epoch == epoch {
            flight.in_flight = false;
            flight.started_at = None;
        }
    }

    /// Returns true when a stuck guard was cleared.
    fn health_check(&self) -> bool {
        let mut flight = self.flight();
        let stuck = flight.in_flight
            && flight
                .started_at
                .map(|at| at.elapsed() >= self.config.stuck_timeout)
                .unwrap_or(false);
        if stuck {
            tracing::warn!(
                "[{}] scan #{} held the guard for over {:?}, forcing reset",
                self.target.name(),
                flight.epoch,
                self.config.stuck_timeout
            );
            flight.in_flight = false;
            flight.started_at = None;
            // A late completion of the abandoned scan must not release a newer one.
            flight.epoch += 1;
        }
        stuck
    }

    fn classify(&self, event: HostEvent) -> Dispatch {
        match event {
            HostEvent::ChatChanged => Dispatch::Immediate,
            HostEvent::InputChanged => Dispatch::Debounced,
            HostEvent::MessageSent | HostEvent::MessageReceived | HostEvent::MessageEdited => {
                let threshold = self.config.message_threshold;
                let grown = self
                    .target
                    .message_count()
                    .saturating_sub(self.baseline_count.load(Ordering::SeqCst));
                if threshold > 0 && grown >= threshold {
                    Dispatch::Immediate
                } else {
                    Dispatch::Debounced
                }
            }
        }
    }
}

pub struct PollingScheduler {
    shared: Arc<Shared>,
    events: Option<HostEventBus>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PollingScheduler {
    pub fn new(target: Arc<dyn ScanTarget>, config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                target,
                config,
                flight: Mutex::new(Flight {
                    active: false,
                    in_flight: false,
                    epoch: 0,
                    started_at: None,
                }),
                baseline_count: AtomicUsize::new(0),
                scans_started: AtomicU64::new(0),
            }),
            events: None,
            driver: Mutex::new(None),
        }
    }

    /// Also scan on host lifecycle events.
    pub fn with_events(mut self, bus: HostEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        self.shared.target.name()
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.flight().state()
    }

    pub fn scans_started(&self) -> u64 {
        self.shared.scans_started.load(Ordering::SeqCst)
    }

    /// Arm the timer and event subscription. The first timer tick fires
    /// immediately, so starting always performs an initial scan. Must be
    /// called inside a tokio runtime. Returns false if already started.
    pub fn start(&self) -> bool {
        {
            let mut flight = self.shared.flight();
            if flight.active {
                return false;
            }
            flight.active = true;
        }

        let events = self.events.as_ref().map(HostEventBus::subscribe);
        let handle = tokio::spawn(drive(Arc::clone(&self.shared), events));
        if let Some(old) = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }

        tracing::info!(
            "[{}] polling every {:?} (debounce {:?}, threshold {})",
            self.name(),
            self.shared.config.poll_interval,
            self.shared.config.debounce,
            self.shared.config.message_threshold
        );
        true
    }

    /// Cancel the timer and unsubscribe. A scan already in flight runs to
    /// completion and keeps the guard, so a quick restart waits for it.
    pub fn stop(&self) {
        if let Some(handle) = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.shared.flight().active = false;
        tracing::info!("[{}] polling stopped", self.shared.target.name());
    }

    /// Request a scan right now (e.g. after a write-back).
    pub fn request_scan(&self) -> ScanRequest {
        self.shared.request_scan("manual")
    }

    pub fn health_check(&self) -> bool {
        self.shared.health_check()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self
            .driver
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

async fn drive(shared: Arc<Shared>, mut events: Option<broadcast::Receiver<HostEvent>>) {
    let config = shared.config.clone();

    let mut ticker = time::interval(config.poll_interval.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let health_period = config.health_check_interval.max(MIN_PERIOD);
    let mut health = time::interval_at(Instant::now() + health_period, health_period);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut debounce_until: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.request_scan("timer");
            }
            _ = health.tick() => {
                shared.health_check();
            }
            event = next_event(&mut events) => match event {
                Some(event) => match shared.classify(event) {
                    Dispatch::Immediate => {
                        debounce_until = None;
                        shared.request_scan("event");
                    }
                    Dispatch::Debounced => {
                        debounce_until = Some(Instant::now() + config.debounce);
                    }
                },
                None => {
                    tracing::debug!("[{}] host event bus closed", shared.target.name());
                    events = None;
                }
            },
            _ = sleep_until_opt(debounce_until) => {
                debounce_until = None;
                shared.request_scan("debounce");
            }
        }
    }
}

async fn next_event(events: &mut Option<broadcast::Receiver<HostEvent>>) -> Option<HostEvent> {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(event) => Some(event),
        // Missed events mean a burst; let the threshold decide.
        Err(RecvError::Lagged(skipped)) => {
            tracing::debug!("Host event subscriber lagged by {} event(s)", skipped);
            Some(HostEvent::MessageReceived)
        }
        Err(RecvError::Closed) => None,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
