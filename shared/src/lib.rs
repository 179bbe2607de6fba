#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Durable offline queue with background delivery.
//!
//! Page contexts post `ENQUEUE` messages to a [`SyncWorker`]; items are
//! persisted per named queue before the receipt goes out, then delivered in
//! bounded batches whenever connectivity allows. Nothing is removed from the
//! store until the server acknowledges or terminally rejects it.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod store;
pub mod transport;
#[cfg(not(target_arch = "wasm32"))]
pub mod worker;

pub const MAX_BATCH_SIZE: usize = 50;
pub const DEFAULT_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_TRANSPORT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TRANSPORT_TIMEOUT_MS: u64 = 300_000;

pub use config::{ConfigError, QueueConfig, SyncConfig};
pub use coordinator::{BackgroundSync, Connectivity, RetryPolicy, SyncCoordinator, SyncTrigger};
pub use dispatch::{BatchDispatcher, CycleReport};
pub use error::{ErrorKind, ErrorSeverity, SyncError, SyncResult};
pub use gateway::EnqueueGateway;
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use model::{ItemId, QueueItem, QueueName, SyncOutcome, UnixTimeMs};
pub use notify::{ClientNotifier, PageSubscription};
pub use protocol::{ClientMessage, EnqueueReceipt, PageMessage, WorkerEvent};
pub use store::{QueueHandle, QueueStore, StoreError};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteQueueStore;
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{Transport, TransportResult, ValidatedUrl};
#[cfg(not(target_arch = "wasm32"))]
pub use worker::{open_store, SyncWorker};
