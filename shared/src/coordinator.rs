use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::dispatch::{BatchDispatcher, CycleReport};
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::model::QueueName;
use crate::store::{QueueHandle, QueueStore};

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    Enqueued,
    ConnectivityRestored,
    Manual,
    Retry,
    Startup,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Enqueued => "enqueued",
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Retry => "retry",
            SyncTrigger::Startup => "startup",
        }
    }
}

/// Platform primitive that wakes the worker with `WorkerEvent::Sync` once the
/// device is online, even if every page has been closed.
#[async_trait]
pub trait BackgroundSync: Send + Sync {
    async fn register(&self, queue: &QueueName) -> Result<(), SyncError>;
}

/// Shared online/offline flag.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set(&self, online: bool) -> bool {
        self.0.swap(online, Ordering::SeqCst)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[must_use]
pub fn calculate_backoff(base_ms: u64, max_ms: u64, failures: u32, jitter_ms: u64) -> u64 {
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(failures));
    let capped = exponential.min(max_ms);
    capped.saturating_add(jitter_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_max_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_ms: config.base_backoff_ms,
            max_ms: config.max_backoff_ms,
            jitter_max_ms: config.jitter_max_ms,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failed
    /// cycles (the first failure waits `base_ms` plus jitter).
    pub fn delay(&self, failures: u32) -> Duration {
        let jitter = if self.jitter_max_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_max_ms)
        };
        Duration::from_millis(calculate_backoff(
            self.base_ms,
            self.max_ms,
            failures.saturating_sub(1),
            jitter,
        ))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Dispatching { follow_up: bool },
}

#[derive(Debug)]
struct QueueSlot {
    state: SlotState,
    consecutive_failures: u32,
    retry_pending: bool,
}

impl QueueSlot {
    fn new() -> Self {
        Self {
            state: SlotState::Idle,
            consecutive_failures: 0,
            retry_pending: false,
        }
    }
}

/// Per-queue single-flight scheduler in front of the dispatcher.
///
/// Each queue moves `Idle -> Triggered -> Dispatching -> Idle`. The
/// `Triggered` state has no slot of its own: a trigger on an idle queue goes
/// straight to `Dispatching { follow_up: false }`, and a trigger on a queue
/// that is already dispatching sets `follow_up`, which folds any number of
/// them into one follow-up cycle run as soon as the current cycle completes.
pub struct SyncCoordinator {
    dispatcher: BatchDispatcher,
    store: Arc<dyn QueueStore>,
    slots: Mutex<HashMap<QueueName, QueueSlot>>,
    connectivity: Connectivity,
    background_sync: Option<Arc<dyn BackgroundSync>>,
    retry: RetryPolicy,
    metrics: Arc<SyncMetrics>,
}

impl SyncCoordinator {
    pub fn new(
        dispatcher: BatchDispatcher,
        store: Arc<dyn QueueStore>,
        connectivity: Connectivity,
        background_sync: Option<Arc<dyn BackgroundSync>>,
        retry: RetryPolicy,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            slots: Mutex::new(HashMap::new()),
            connectivity,
            background_sync,
            retry,
            metrics,
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn has_background_sync(&self) -> bool {
        self.background_sync.is_some()
    }

    pub fn is_dispatching(&self, queue: &QueueName) -> bool {
        self.slots
            .lock()
            .map(|slots| {
                slots
                    .get(queue)
                    .is_some_and(|slot| matches!(slot.state, SlotState::Dispatching { .. }))
            })
            .unwrap_or(false)
    }

    pub fn consecutive_failures(&self, queue: &QueueName) -> u32 {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(queue).map(|slot| slot.consecutive_failures))
            .unwrap_or(0)
    }

    /// Entry point after an enqueue: hand the queue to the platform primitive
    /// when there is one, otherwise dispatch now if online and defer if not.
    pub async fn request_sync(self: &Arc<Self>, queue: &QueueName) -> Option<CycleReport> {
        if let Some(background_sync) = &self.background_sync {
            match background_sync.register(queue).await {
                Ok(()) => {
                    debug!(queue = %queue, "Background sync registered");
                    return None;
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Background sync registration failed, dispatching directly");
                }
            }
        }

        if !self.connectivity.is_online() {
            debug!(queue = %queue, "Offline without background sync, deferring to next trigger");
            return None;
        }

        self.trigger(queue, SyncTrigger::Enqueued).await
    }

    /// Runs a cycle for `queue` unless one is already running, in which case
    /// the trigger is coalesced and `None` is returned. Returns the report of
    /// the last cycle run by this call.
    #[instrument(skip(self), fields(queue = %queue, trigger = trigger.as_str()))]
    pub async fn trigger(self: &Arc<Self>, queue: &QueueName, trigger: SyncTrigger) -> Option<CycleReport> {
        if !self.begin(queue) {
            SyncMetrics::incr(&self.metrics.triggers_coalesced);
            debug!("Cycle already in flight, trigger coalesced");
            return None;
        }

        let handle = QueueHandle::bind(Arc::clone(&self.store), queue.clone());
        loop {
            let report = self.dispatcher.run_cycle(&handle).await;
            if let Some(failures) = self.finish_cycle(queue, &report) {
                if !report.success || report.retried > 0 {
                    self.after_incomplete_cycle(queue, &report, failures).await;
                }
                return Some(report);
            }
            debug!("Running coalesced follow-up cycle");
        }
    }

    /// Marks the queue connected/disconnected. Returns true on an
    /// offline-to-online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.connectivity.set(online);
        let restored = online && !was_online;
        if restored {
            info!("Connectivity restored");
        } else if !online && was_online {
            info!("Connectivity lost");
        }
        restored
    }

    fn begin(&self, queue: &QueueName) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        let slot = slots.entry(queue.clone()).or_insert_with(QueueSlot::new);
        if let SlotState::Dispatching { follow_up } = &mut slot.state {
            *follow_up = true;
            return false;
        }
        slot.state = SlotState::Dispatching { follow_up: false };
        true
    }

    /// Returns `None` if a follow-up cycle is due, otherwise settles the slot
    /// and returns its consecutive failure count.
    fn finish_cycle(&self, queue: &QueueName, report: &CycleReport) -> Option<u32> {
        let Ok(mut slots) = self.slots.lock() else {
            return Some(0);
        };
        let slot = slots.entry(queue.clone()).or_insert_with(QueueSlot::new);

        if report.success && report.retried == 0 {
            slot.consecutive_failures = 0;
        } else {
            slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
        }

        if let SlotState::Dispatching { follow_up: true } = slot.state {
            slot.state = SlotState::Dispatching { follow_up: false };
            return None;
        }
        slot.state = SlotState::Idle;
        Some(slot.consecutive_failures)
    }

    async fn after_incomplete_cycle(self: &Arc<Self>, queue: &QueueName, report: &CycleReport, failures: u32) {
        let retryable = report.retried > 0
            || report.error.as_ref().is_some_and(SyncError::is_retryable);
        if !retryable {
            return;
        }

        if let Some(background_sync) = &self.background_sync {
            if let Err(e) = background_sync.register(queue).await {
                warn!(queue = %queue, error = %e, "Background sync re-registration failed");
            } else {
                return;
            }
        }

        if !self.connectivity.is_online() {
            debug!(queue = %queue, "Offline, no retry timer scheduled");
            return;
        }
        self.schedule_retry(queue, failures);
    }

    fn schedule_retry(self: &Arc<Self>, queue: &QueueName, failures: u32) {
        {
            let Ok(mut slots) = self.slots.lock() else {
                return;
            };
            let slot = slots.entry(queue.clone()).or_insert_with(QueueSlot::new);
            if slot.retry_pending {
                return;
            }
            slot.retry_pending = true;
        }

        let delay = self.retry.delay(failures);
        SyncMetrics::incr(&self.metrics.retries_scheduled);
        info!(queue = %queue, failures, delay_ms = delay.as_millis() as u64, "Retry scheduled");

        let coordinator = Arc::clone(self);
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut slots) = coordinator.slots.lock() {
                if let Some(slot) = slots.get_mut(&queue) {
                    slot.retry_pending = false;
                }
            }
            if coordinator.connectivity.is_online() {
                coordinator.trigger(&queue, SyncTrigger::Retry).await;
            }
        });
    }
}
