use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::error::SyncError;
use crate::model::{ItemId, QueueItem, QueueName, UnixTimeMs};

#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteQueueStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("persistent storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted item {id} in queue {queue}: {reason}")]
    Corrupted {
        queue: QueueName,
        id: ItemId,
        reason: String,
    },

    #[error("lock acquisition failed")]
    LockFailed,
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => SyncError::StorageUnavailable(msg),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Durable per-queue item storage.
///
/// Every operation is atomic on its own. Ids are assigned by the store,
/// strictly increasing per queue and never reused, even after the highest
/// id has been removed.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Creates the queue's backing table on first use. Idempotent.
    async fn open(&self, queue: &QueueName) -> Result<(), StoreError>;

    /// Durable before returning.
    async fn enqueue(
        &self,
        queue: &QueueName,
        payload: &serde_json::Value,
        now: UnixTimeMs,
    ) -> Result<ItemId, StoreError>;

    /// All items not yet removed, ascending id.
    async fn list_pending(&self, queue: &QueueName) -> Result<Vec<QueueItem>, StoreError>;

    /// Returns how many rows were actually deleted. Missing ids are ignored.
    async fn remove(&self, queue: &QueueName, ids: &[ItemId]) -> Result<usize, StoreError>;

    async fn increment_attempts(&self, queue: &QueueName, ids: &[ItemId]) -> Result<(), StoreError>;

    /// Deletes every item with `enqueued_at <= cutoff` and returns their ids.
    async fn purge_expired(
        &self,
        queue: &QueueName,
        cutoff: UnixTimeMs,
    ) -> Result<Vec<ItemId>, StoreError>;

    async fn pending_count(&self, queue: &QueueName) -> Result<usize, StoreError>;

    /// Every queue that has a backing table, including ones opened by an
    /// earlier process.
    async fn queues(&self) -> Result<Vec<QueueName>, StoreError>;
}

/// A queue name bound to a store.
#[derive(Clone)]
pub struct QueueHandle {
    name: QueueName,
    store: Arc<dyn QueueStore>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle").field("name", &self.name).finish()
    }
}

impl QueueHandle {
    pub async fn open(store: Arc<dyn QueueStore>, name: QueueName) -> Result<Self, StoreError> {
        store.open(&name).await?;
        Ok(Self { name, store })
    }

    /// Binds without creating the table; the store creates it lazily.
    pub(crate) fn bind(store: Arc<dyn QueueStore>, name: QueueName) -> Self {
        Self { name, store }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub async fn enqueue(
        &self,
        payload: &serde_json::Value,
        now: UnixTimeMs,
    ) -> Result<ItemId, StoreError> {
        self.store.enqueue(&self.name, payload, now).await
    }

    pub async fn list_pending(&self) -> Result<Vec<QueueItem>, StoreError> {
        self.store.list_pending(&self.name).await
    }

    pub async fn remove(&self, ids: &[ItemId]) -> Result<usize, StoreError> {
        self.store.remove(&self.name, ids).await
    }

    pub async fn increment_attempts(&self, ids: &[ItemId]) -> Result<(), StoreError> {
        self.store.increment_attempts(&self.name, ids).await
    }

    pub async fn purge_expired(&self, cutoff: UnixTimeMs) -> Result<Vec<ItemId>, StoreError> {
        self.store.purge_expired(&self.name, cutoff).await
    }

    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        self.store.pending_count(&self.name).await
    }
}
