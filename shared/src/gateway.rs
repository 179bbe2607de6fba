use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::model::{ItemId, QueueName, UnixTimeMs};
use crate::protocol::EnqueueReceipt;
use crate::store::QueueStore;

/// Admits work from page contexts: validate, persist, acknowledge receipt,
/// then hand the queue to the coordinator.
pub struct EnqueueGateway {
    store: Arc<dyn QueueStore>,
    coordinator: Arc<SyncCoordinator>,
    queues: HashSet<QueueName>,
    max_payload_bytes: usize,
    metrics: Arc<SyncMetrics>,
}

impl EnqueueGateway {
    pub fn new(
        store: Arc<dyn QueueStore>,
        coordinator: Arc<SyncCoordinator>,
        config: &SyncConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            store,
            coordinator,
            queues: config.queues.iter().map(|q| q.name.clone()).collect(),
            max_payload_bytes: config.max_payload_bytes,
            metrics,
        }
    }

    /// Validates and durably stores one payload. Does not schedule delivery.
    #[instrument(skip(self, payload))]
    pub async fn admit(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
    ) -> Result<(QueueName, ItemId), SyncError> {
        let queue = QueueName::new(queue_name)?;
        if !self.queues.contains(&queue) {
            return Err(SyncError::UnknownQueue(queue.to_string()));
        }

        let size = serde_json::to_vec(payload)
            .map_err(|e| SyncError::InvalidMessage(e.to_string()))?
            .len();
        if size > self.max_payload_bytes {
            return Err(SyncError::PayloadTooLarge {
                size,
                max: self.max_payload_bytes,
            });
        }

        let id = self
            .store
            .enqueue(&queue, payload, UnixTimeMs::now())
            .await
            .map_err(|e| {
                SyncMetrics::incr(&self.metrics.storage_errors);
                SyncError::from(e)
            })?;

        SyncMetrics::incr(&self.metrics.items_enqueued);
        debug!(queue = %queue, item_id = %id, size, "Item enqueued");
        Ok((queue, id))
    }

    /// Full `ENQUEUE` handling. The receipt goes out before any delivery
    /// attempt starts.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        correlation_id: Option<String>,
        reply: Option<oneshot::Sender<EnqueueReceipt>>,
    ) -> EnqueueReceipt {
        let admitted = self.admit(queue_name, &payload).await;

        let receipt = match &admitted {
            Ok((queue, id)) => EnqueueReceipt::Enqueued {
                queue_name: queue.to_string(),
                id: *id,
                correlation_id,
            },
            Err(e) => {
                warn!(queue = queue_name, code = e.code(), error = %e, "Enqueue refused");
                EnqueueReceipt::failed(queue_name, e, correlation_id)
            }
        };

        if let Some(reply) = reply {
            if reply.send(receipt.clone()).is_err() {
                debug!(queue = queue_name, "Page context gone before enqueue receipt");
            }
        }

        if let Ok((queue, _)) = admitted {
            self.coordinator.request_sync(&queue).await;
        }
        receipt
    }
}
