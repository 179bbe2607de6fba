use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::model::{ItemId, QueueItem, QueueName};
use crate::notify::ClientNotifier;
use crate::protocol::ClientMessage;
use crate::store::QueueHandle;
use crate::transport::{Transport, TransportResult};

/// Summary of one dispatch cycle for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub queue: QueueName,
    pub success: bool,
    pub acknowledged: usize,
    pub rejected: usize,
    /// Items the server asked to have resent. They stay pending.
    pub retried: usize,
    pub batches_sent: usize,
    pub processed_count: usize,
    pub remaining_count: usize,
    pub error: Option<SyncError>,
}

impl CycleReport {
    fn new(queue: QueueName) -> Self {
        Self {
            queue,
            success: true,
            acknowledged: 0,
            rejected: 0,
            retried: 0,
            batches_sent: 0,
            processed_count: 0,
            remaining_count: 0,
            error: None,
        }
    }

    fn fail(&mut self, err: SyncError) {
        self.success = false;
        self.error = Some(err);
    }

    fn finish(&mut self, snapshot_len: usize) {
        self.processed_count = self.acknowledged + self.rejected;
        self.remaining_count = snapshot_len.saturating_sub(self.processed_count);
    }

    pub fn status_message(&self) -> ClientMessage {
        ClientMessage::SyncStatus {
            queue_name: self.queue.to_string(),
            success: self.success,
            processed_count: self.processed_count,
            remaining_count: self.remaining_count,
            error: self.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Splits `items` into consecutive batches of at most `max_batch_size`,
/// keeping their order.
pub fn partition_batches(items: Vec<QueueItem>, max_batch_size: usize) -> Vec<Vec<QueueItem>> {
    let size = max_batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Runs one delivery cycle: snapshot, batch, submit, reconcile, report.
pub struct BatchDispatcher {
    transport: Arc<dyn Transport>,
    notifier: ClientNotifier,
    metrics: Arc<SyncMetrics>,
    max_batch_size: usize,
}

impl BatchDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        notifier: ClientNotifier,
        metrics: Arc<SyncMetrics>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            transport,
            notifier,
            metrics,
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Dispatches everything pending in `queue` and broadcasts exactly one
    /// `SYNC_STATUS`. Never fails: errors end up in the report.
    #[instrument(skip(self, queue), fields(queue = %queue.name()))]
    pub async fn run_cycle(&self, queue: &QueueHandle) -> CycleReport {
        SyncMetrics::incr(&self.metrics.cycles_started);

        let report = self.dispatch(queue).await;

        if report.success {
            info!(
                acknowledged = report.acknowledged,
                rejected = report.rejected,
                remaining = report.remaining_count,
                batches = report.batches_sent,
                "Sync cycle completed"
            );
        } else {
            SyncMetrics::incr(&self.metrics.cycles_failed);
            warn!(
                processed = report.processed_count,
                remaining = report.remaining_count,
                error = ?report.error,
                "Sync cycle failed"
            );
        }

        self.notifier.broadcast(report.status_message());
        report
    }

    async fn dispatch(&self, queue: &QueueHandle) -> CycleReport {
        let mut report = CycleReport::new(queue.name().clone());

        let items = match queue.list_pending().await {
            Ok(items) => items,
            Err(e) => {
                self.storage_failure(&mut report, "list pending items", e.into());
                return report;
            }
        };
        let snapshot_len = items.len();

        for batch in partition_batches(items, self.max_batch_size) {
            let ids: Vec<ItemId> = batch.iter().map(|item| item.id).collect();

            if let Err(e) = queue.increment_attempts(&ids).await {
                self.storage_failure(&mut report, "record delivery attempt", e.into());
                break;
            }

            SyncMetrics::incr(&self.metrics.batches_sent);
            report.batches_sent += 1;

            match self.transport.send(queue.name(), &batch).await {
                TransportResult::Delivered(outcome) => {
                    for id in &outcome.rejected {
                        warn!(item_id = %id, "Server rejected item, discarding");
                    }
                    if let Err(e) = queue.remove(&outcome.removable()).await {
                        self.storage_failure(&mut report, "remove delivered items", e.into());
                        break;
                    }
                    SyncMetrics::add(&self.metrics.items_acknowledged, outcome.acknowledged.len());
                    SyncMetrics::add(&self.metrics.items_rejected, outcome.rejected.len());
                    report.acknowledged += outcome.acknowledged.len();
                    report.rejected += outcome.rejected.len();
                    report.retried += outcome.retry.len();
                }
                TransportResult::Rejected { status, message } => {
                    warn!(
                        status,
                        %message,
                        batch_len = ids.len(),
                        "Server rejected batch, discarding every item in it"
                    );
                    if let Err(e) = queue.remove(&ids).await {
                        self.storage_failure(&mut report, "remove rejected batch", e.into());
                        break;
                    }
                    SyncMetrics::add(&self.metrics.items_rejected, ids.len());
                    report.rejected += ids.len();
                }
                TransportResult::Retryable(err) => {
                    warn!(error = %err, batch_len = ids.len(), "Batch not delivered, keeping it for a later cycle");
                    report.fail(err);
                    break;
                }
            }
        }

        report.finish(snapshot_len);
        report
    }

    fn storage_failure(&self, report: &mut CycleReport, action: &str, err: SyncError) {
        SyncMetrics::incr(&self.metrics.storage_errors);
        error!(error = %err, action, "Storage failure, aborting sync cycle");
        report.fail(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnixTimeMs;
    use crate::store::testing::FailableStore;
    use crate::store::{QueueStore, SqliteQueueStore};
    use crate::transport::testing::{Reply, ScriptedTransport};
    use proptest::prelude::*;
    use serde_json::json;

    struct Fixture {
        queue: QueueHandle,
        transport: Arc<ScriptedTransport>,
        notifier: ClientNotifier,
        metrics: Arc<SyncMetrics>,
        dispatcher: BatchDispatcher,
    }

    async fn fixture(transport: ScriptedTransport, max_batch_size: usize) -> Fixture {
        let store: Arc<dyn QueueStore> = Arc::new(SqliteQueueStore::in_memory().unwrap());
        fixture_with_store(store, transport, max_batch_size).await
    }

    async fn fixture_with_store(
        store: Arc<dyn QueueStore>,
        transport: ScriptedTransport,
        max_batch_size: usize,
    ) -> Fixture {
        let queue = QueueHandle::open(store, QueueName::new("analytics-events").unwrap())
            .await
            .unwrap();
        let transport = Arc::new(transport);
        let notifier = ClientNotifier::new(16);
        let metrics = Arc::new(SyncMetrics::new());
        let dispatcher = BatchDispatcher::new(
            transport.clone(),
            notifier.clone(),
            metrics.clone(),
            max_batch_size,
        );
        Fixture {
            queue,
            transport,
            notifier,
            metrics,
            dispatcher,
        }
    }

    async fn enqueue_n(queue: &QueueHandle, n: u64) -> Vec<ItemId> {
        let mut ids = Vec::new();
        for i in 0..n {
            ids.push(
                queue
                    .enqueue(&json!({ "seq": i }), UnixTimeMs(1_700_000_000_000 + i))
                    .await
                    .unwrap(),
            );
        }
        ids
    }

    fn item(id: u64) -> QueueItem {
        QueueItem {
            id: ItemId(id),
            queue: QueueName::new("analytics-events").unwrap(),
            payload: json!(id),
            enqueued_at: UnixTimeMs(0),
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_all_accepted_empties_queue() {
        let f = fixture(
            ScriptedTransport::new(Reply::json(200, json!({ "accepted": [0, 1, 2] }))),
            50,
        )
        .await;
        let mut sub = f.notifier.subscribe();
        enqueue_n(&f.queue, 3).await;

        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(report.success);
        assert_eq!(report.acknowledged, 3);
        assert_eq!(report.processed_count, 3);
        assert_eq!(report.remaining_count, 0);
        assert!(f.queue.list_pending().await.unwrap().is_empty());
        assert_eq!(
            sub.try_recv(),
            Some(ClientMessage::SyncStatus {
                queue_name: "analytics-events".into(),
                success: true,
                processed_count: 3,
                remaining_count: 0,
                error: None,
            })
        );
    }

    #[tokio::test]
    async fn test_network_error_keeps_items_and_counts_attempt() {
        let f = fixture(ScriptedTransport::new(Reply::Network), 50).await;
        let mut sub = f.notifier.subscribe();
        enqueue_n(&f.queue, 2).await;

        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(!report.success);
        assert!(report.error.as_ref().is_some_and(SyncError::is_retryable));
        let pending = f.queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|item| item.attempts == 1));

        match sub.try_recv() {
            Some(ClientMessage::SyncStatus {
                success,
                processed_count,
                remaining_count,
                error,
                ..
            }) => {
                assert!(!success);
                assert_eq!(processed_count, 0);
                assert_eq!(remaining_count, 2);
                assert!(error.is_some());
            }
            other => panic!("expected SYNC_STATUS, got {other:?}"),
        }
        assert_eq!(f.metrics.snapshot().cycles_failed, 1);
    }

    #[tokio::test]
    async fn test_batches_respect_cap_and_order() {
        let f = fixture(ScriptedTransport::accepting(), 2).await;
        let ids = enqueue_n(&f.queue, 5).await;

        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(report.success);
        assert_eq!(report.batches_sent, 3);
        let batches: Vec<Vec<ItemId>> = f.transport.calls().into_iter().map(|(_, b)| b).collect();
        assert_eq!(
            batches,
            vec![ids[0..2].to_vec(), ids[2..4].to_vec(), ids[4..5].to_vec()]
        );
        assert_eq!(f.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminal_rejection_discards_batch() {
        let f = fixture(ScriptedTransport::new(Reply::status(400)), 50).await;
        enqueue_n(&f.queue, 1).await;

        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(report.success);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.processed_count, 1);
        assert!(f.queue.list_pending().await.unwrap().is_empty());
        assert_eq!(f.metrics.snapshot().items_rejected, 1);
    }

    #[tokio::test]
    async fn test_rejection_continues_with_next_batch() {
        let f = fixture(
            ScriptedTransport::accepting().with_script([Reply::status(422)]),
            2,
        )
        .await;
        enqueue_n(&f.queue, 4).await;

        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(report.success);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.acknowledged, 2);
        assert_eq!(f.transport.call_count(), 2);
        assert_eq!(f.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_stops_cycle() {
        let f = fixture(
            ScriptedTransport::accepting().with_script([Reply::ok(), Reply::status(503)]),
            2,
        )
        .await;
        let ids = enqueue_n(&f.queue, 6).await;

        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(!report.success);
        assert_eq!(f.transport.call_count(), 2);
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.remaining_count, 4);
        let pending: Vec<ItemId> = f
            .queue
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(pending, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn test_partial_outcome_keeps_retry_items() {
        let f = fixture(
            ScriptedTransport::new(Reply::json(
                200,
                json!({ "accepted": [0], "rejected": [2] }),
            )),
            50,
        )
        .await;
        let ids = enqueue_n(&f.queue, 3).await;

        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(report.success);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(report.processed_count, 2);
        assert_eq!(report.remaining_count, 1);
        let pending = f.queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ids[1]);
    }

    #[tokio::test]
    async fn test_empty_queue_is_successful_noop() {
        let f = fixture(ScriptedTransport::accepting(), 50).await;
        let mut sub = f.notifier.subscribe();

        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(report.success);
        assert_eq!(report.batches_sent, 0);
        assert_eq!(f.transport.call_count(), 0);
        assert!(sub.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_cycle() {
        let store = Arc::new(FailableStore::new(SqliteQueueStore::in_memory().unwrap()));
        let f = fixture_with_store(store.clone(), ScriptedTransport::accepting(), 50).await;
        enqueue_n(&f.queue, 2).await;

        store.set_fail_reads(true);
        let report = f.dispatcher.run_cycle(&f.queue).await;
        assert!(!report.success);
        assert_eq!(f.transport.call_count(), 0);
        assert_eq!(f.metrics.snapshot().storage_errors, 1);

        store.set_fail_reads(false);
        store.set_fail_removes(true);
        let report = f.dispatcher.run_cycle(&f.queue).await;
        assert!(!report.success);
        assert_eq!(report.processed_count, 0);
        assert_eq!(f.transport.call_count(), 1);

        // Delivered but not removed: resent next cycle (at-least-once).
        store.set_fail_removes(false);
        let report = f.dispatcher.run_cycle(&f.queue).await;
        assert!(report.success);
        assert_eq!(report.acknowledged, 2);
        assert_eq!(f.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_attempt_write_failure_sends_nothing() {
        let store = Arc::new(FailableStore::new(SqliteQueueStore::in_memory().unwrap()));
        let f = fixture_with_store(store.clone(), ScriptedTransport::accepting(), 50).await;
        enqueue_n(&f.queue, 1).await;

        store.set_fail_writes(true);
        let report = f.dispatcher.run_cycle(&f.queue).await;

        assert!(!report.success);
        assert_eq!(f.transport.call_count(), 0);
        assert_eq!(f.queue.pending_count().await.unwrap(), 1);
    }

    #[test]
    fn test_partition_batches_exact_multiple() {
        let batches = partition_batches((1..=4).map(item).collect(), 2);
        assert_eq!(batches.len(), 2);
        assert!(partition_batches(Vec::new(), 2).is_empty());
    }

    proptest! {
        #[test]
        fn partition_preserves_order_and_cap(n in 0usize..200, cap in 1usize..60) {
            let items: Vec<QueueItem> = (1..=n as u64).map(item).collect();
            let batches = partition_batches(items.clone(), cap);

            prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= cap));
            prop_assert_eq!(batches.len(), n.div_ceil(cap));
            let flattened: Vec<QueueItem> = batches.into_iter().flatten().collect();
            prop_assert_eq!(flattened, items);
        }
    }
}
