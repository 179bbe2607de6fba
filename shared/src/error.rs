use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::QueueName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    StorageUnavailable,
    Storage,
    Network,
    Timeout,
    ServerRejected,
    ItemRejected,
    Stale,
    Validation,
    UnknownQueue,
    Config,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::Storage => "STORAGE_ERROR",
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ServerRejected => "SERVER_REJECTED",
            Self::ItemRejected => "ITEM_REJECTED",
            Self::Stale => "PERMANENTLY_STALE",
            Self::Validation => "VALIDATION_ERROR",
            Self::UnknownQueue => "UNKNOWN_QUEUE",
            Self::Config => "CONFIG_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Storage | Self::Network | Self::Timeout => ErrorSeverity::Transient,

            Self::StorageUnavailable | Self::Config | Self::Internal => ErrorSeverity::Fatal,

            Self::ServerRejected
            | Self::ItemRejected
            | Self::Stale
            | Self::Validation
            | Self::UnknownQueue => ErrorSeverity::Permanent,
        }
    }

    /// Whether the affected items stay in the store for a later cycle.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Storage | Self::Network | Self::Timeout)
    }
}

/// Every failure the engine can observe. Nothing here escapes to the host:
/// each variant is turned into retained state or a logged discard by the
/// component that produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("persistent storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport timed out after {timeout_ms}ms")]
    TransportTimeout { timeout_ms: u64 },

    #[error("network error: {0}")]
    TransportNetwork(String),

    #[error("server rejected batch with status {status}: {message}")]
    ServerRejected { status: u16, message: String },

    #[error("server rejected item {id} in queue {queue}")]
    ItemRejected { queue: QueueName, id: u64 },

    #[error("item {id} in queue {queue} exceeded the retention horizon")]
    PermanentlyStale { queue: QueueName, id: u64 },

    #[error("invalid queue name: {0}")]
    InvalidQueueName(String),

    #[error("invalid page message: {0}")]
    InvalidMessage(String),

    #[error("queue {0} has no configured endpoint")]
    UnknownQueue(String),

    #[error("payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::Storage(_) => ErrorKind::Storage,
            Self::TransportTimeout { .. } => ErrorKind::Timeout,
            Self::TransportNetwork(_) => ErrorKind::Network,
            Self::ServerRejected { .. } => ErrorKind::ServerRejected,
            Self::ItemRejected { .. } => ErrorKind::ItemRejected,
            Self::PermanentlyStale { .. } => ErrorKind::Stale,
            Self::InvalidQueueName(_) | Self::InvalidMessage(_) | Self::PayloadTooLarge { .. } => {
                ErrorKind::Validation
            }
            Self::UnknownQueue(_) => ErrorKind::UnknownQueue,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind().code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
