use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SyncConfig;
use crate::coordinator::{BackgroundSync, Connectivity, RetryPolicy, SyncCoordinator, SyncTrigger};
use crate::dispatch::{BatchDispatcher, CycleReport};
use crate::error::SyncError;
use crate::gateway::EnqueueGateway;
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::model::{QueueName, UnixTimeMs};
use crate::notify::{ClientNotifier, PageSubscription};
use crate::protocol::{PageMessage, WorkerEvent};
use crate::store::{QueueHandle, QueueStore, StoreError};
use crate::transport::Transport;

/// Opens the durable store at `config.database_path`. A missing path is a
/// configuration error; queues are never silently kept in memory.
#[cfg(not(target_arch = "wasm32"))]
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn QueueStore>, SyncError> {
    use crate::store::SqliteQueueStore;

    let Some(path) = &config.database_path else {
        error!("No database path configured, refusing to open a volatile store");
        return Err(SyncError::Config("database_path is required".into()));
    };
    let store = SqliteQueueStore::open_path(path).await?;
    Ok(Arc::new(store))
}

/// The background process that owns the queues.
///
/// Built once per process start by [`SyncWorker::initialize`]; a restart is
/// the normal case and everything it needs is recovered from the store.
pub struct SyncWorker {
    config: Arc<SyncConfig>,
    store: Arc<dyn QueueStore>,
    coordinator: Arc<SyncCoordinator>,
    gateway: EnqueueGateway,
    notifier: ClientNotifier,
    metrics: Arc<SyncMetrics>,
}

impl SyncWorker {
    /// Validates `config`, opens every configured queue and wires the
    /// components together. This is the only fallible step; once built, the
    /// worker never surfaces errors to the host.
    #[instrument(skip_all, fields(queues = config.queues.len()))]
    pub async fn initialize(
        config: SyncConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        background_sync: Option<Arc<dyn BackgroundSync>>,
        connectivity: Connectivity,
    ) -> Result<Arc<Self>, SyncError> {
        config
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let config = Arc::new(config);

        for queue in &config.queues {
            QueueHandle::open(Arc::clone(&store), queue.name.clone())
                .await
                .map_err(|e| {
                    error!(queue = %queue.name, error = %e, "Failed to open queue");
                    SyncError::from(e)
                })?;
        }

        let metrics = Arc::new(SyncMetrics::new());
        let notifier = ClientNotifier::new(config.notify_capacity);
        let dispatcher = BatchDispatcher::new(
            transport,
            notifier.clone(),
            Arc::clone(&metrics),
            config.max_batch_size,
        );
        let coordinator = Arc::new(SyncCoordinator::new(
            dispatcher,
            Arc::clone(&store),
            connectivity,
            background_sync,
            RetryPolicy::from_config(&config),
            Arc::clone(&metrics),
        ));
        let gateway = EnqueueGateway::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            &config,
            Arc::clone(&metrics),
        );

        info!(
            background_sync = coordinator.has_background_sync(),
            "Sync worker initialized"
        );

        Ok(Arc::new(Self {
            config,
            store,
            coordinator,
            gateway,
            notifier,
            metrics,
        }))
    }

    pub fn subscribe(&self) -> PageSubscription {
        self.notifier.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        self.coordinator.connectivity().is_online()
    }

    pub async fn pending_count(&self, queue: &QueueName) -> Result<usize, SyncError> {
        Ok(self.store.pending_count(queue).await?)
    }

    /// Single entry point for everything the platform delivers. Returns the
    /// reports of any cycles this event ran to completion.
    #[instrument(skip_all, fields(event = event.name()))]
    pub async fn handle(self: &Arc<Self>, event: WorkerEvent) -> Vec<CycleReport> {
        match event {
            WorkerEvent::Install => {
                self.install().await;
                Vec::new()
            }
            WorkerEvent::Activate => {
                self.sweep_at(UnixTimeMs::now()).await;
                self.trigger_all(SyncTrigger::Startup).await
            }
            WorkerEvent::Sync { queue } => {
                self.trigger_one(&queue, SyncTrigger::ConnectivityRestored)
                    .await
                    .into_iter()
                    .collect()
            }
            WorkerEvent::Message { envelope, reply } => match envelope {
                PageMessage::Enqueue {
                    queue_name,
                    payload,
                    correlation_id,
                } => {
                    self.gateway
                        .enqueue(&queue_name, payload, correlation_id, reply)
                        .await;
                    Vec::new()
                }
                PageMessage::SyncNow { queue_name } => match self.configured_queue(&queue_name) {
                    Some(queue) => self
                        .trigger_one(&queue, SyncTrigger::Manual)
                        .await
                        .into_iter()
                        .collect(),
                    None => {
                        warn!(queue = %queue_name, "Manual sync requested for unknown queue");
                        Vec::new()
                    }
                },
            },
            WorkerEvent::ConnectivityChanged { online } => {
                if self.coordinator.set_online(online) {
                    self.trigger_all(SyncTrigger::ConnectivityRestored).await
                } else {
                    Vec::new()
                }
            }
            WorkerEvent::Sweep => {
                self.sweep_at(UnixTimeMs::now()).await;
                Vec::new()
            }
        }
    }

    /// Retention pass: removes every item whose deadline has been reached,
    /// across all queues in the store. Returns how many were removed.
    pub async fn sweep_at(&self, now: UnixTimeMs) -> usize {
        let queues = match self.store.queues().await {
            Ok(queues) => queues,
            Err(e) => {
                self.storage_error("list queues for sweep", &e);
                return 0;
            }
        };

        let cutoff = now.saturating_sub_ms(self.config.retention_ms);
        let mut total = 0;
        for queue in queues {
            match self.store.purge_expired(&queue, cutoff).await {
                Ok(expired) => {
                    for id in &expired {
                        let stale = SyncError::PermanentlyStale {
                            queue: queue.clone(),
                            id: id.0,
                        };
                        warn!(error = %stale, "Discarding undelivered item");
                    }
                    SyncMetrics::add(&self.metrics.items_expired, expired.len());
                    total += expired.len();
                }
                Err(e) => self.storage_error("purge expired items", &e),
            }
        }

        if total > 0 {
            info!(expired = total, "Retention sweep completed");
        }
        total
    }

    /// Sends `WorkerEvent::Sweep` to itself every `period` until the returned
    /// handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                worker.handle(WorkerEvent::Sweep).await;
            }
        })
    }

    async fn install(&self) {
        for queue in &self.config.queues {
            if let Err(e) = self.store.open(&queue.name).await {
                self.storage_error("open queue on install", &e);
            }
        }
        info!("Sync worker installed");
    }

    async fn trigger_one(
        self: &Arc<Self>,
        queue: &QueueName,
        trigger: SyncTrigger,
    ) -> Option<CycleReport> {
        if self.config.queue(queue).is_none() {
            warn!(queue = %queue, "Sync requested for a queue with no endpoint, ignoring");
            return None;
        }
        self.coordinator.trigger(queue, trigger).await
    }

    async fn trigger_all(self: &Arc<Self>, trigger: SyncTrigger) -> Vec<CycleReport> {
        if !self.is_online() {
            debug!(trigger = trigger.as_str(), "Offline, not dispatching");
            return Vec::new();
        }
        let mut reports = Vec::new();
        for queue in self.config.queues.iter().map(|q| q.name.clone()) {
            if let Some(report) = self.coordinator.trigger(&queue, trigger).await {
                reports.push(report);
            }
        }
        reports
    }

    fn configured_queue(&self, raw: &str) -> Option<QueueName> {
        QueueName::new(raw)
            .ok()
            .filter(|name| self.config.queue(name).is_some())
    }

    fn storage_error(&self, action: &str, err: &StoreError) {
        SyncMetrics::incr(&self.metrics.storage_errors);
        error!(action, error = %err, "Storage failure");
    }
}
