use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::SyncError;
use crate::model::{ItemId, QueueName};

/// Messages a page context posts to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
    #[serde(rename_all = "camelCase")]
    Enqueue {
        queue_name: String,
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    SyncNow { queue_name: String },
}

impl PageMessage {
    pub fn from_json(raw: &str) -> Result<Self, SyncError> {
        serde_json::from_str(raw).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    pub fn queue_name(&self) -> &str {
        match self {
            PageMessage::Enqueue { queue_name, .. } | PageMessage::SyncNow { queue_name } => {
                queue_name
            }
        }
    }
}

/// Answer to an `ENQUEUE`, sent on the reply channel supplied with it.
/// Confirms receipt and durable storage, not delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnqueueReceipt {
    #[serde(rename_all = "camelCase")]
    Enqueued {
        queue_name: String,
        id: ItemId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    EnqueueFailed {
        queue_name: String,
        code: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl EnqueueReceipt {
    pub fn failed(queue_name: impl Into<String>, err: &SyncError, correlation_id: Option<String>) -> Self {
        EnqueueReceipt::EnqueueFailed {
            queue_name: queue_name.into(),
            code: err.code().to_string(),
            error: err.to_string(),
            correlation_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, EnqueueReceipt::Enqueued { .. })
    }

    pub fn id(&self) -> Option<ItemId> {
        match self {
            EnqueueReceipt::Enqueued { id, .. } => Some(*id),
            EnqueueReceipt::EnqueueFailed { .. } => None,
        }
    }
}

/// Messages the worker broadcasts to every open page context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SyncStatus {
        queue_name: String,
        success: bool,
        processed_count: usize,
        remaining_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Everything the platform can hand the worker.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    /// Platform-delivered background sync for one queue.
    Sync { queue: QueueName },
    Message {
        envelope: PageMessage,
        reply: Option<oneshot::Sender<EnqueueReceipt>>,
    },
    ConnectivityChanged { online: bool },
    /// Periodic retention pass over every known queue.
    Sweep,
}

impl WorkerEvent {
    pub fn message(envelope: PageMessage) -> (Self, oneshot::Receiver<EnqueueReceipt>) {
        let (tx, rx) = oneshot::channel();
        (
            WorkerEvent::Message {
                envelope,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Sync { .. } => "sync",
            WorkerEvent::Message { .. } => "message",
            WorkerEvent::ConnectivityChanged { .. } => "connectivity_changed",
            WorkerEvent::Sweep => "sweep",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_message_wire_format() {
        let raw = r#"{"type":"ENQUEUE","queueName":"analytics-events","payload":{"event":"click"},"correlationId":"c-1"}"#;
        let msg = PageMessage::from_json(raw).unwrap();
        assert_eq!(
            msg,
            PageMessage::Enqueue {
                queue_name: "analytics-events".into(),
                payload: json!({"event": "click"}),
                correlation_id: Some("c-1".into()),
            }
        );
        assert_eq!(msg.queue_name(), "analytics-events");
    }

    #[test]
    fn sync_now_wire_format() {
        let msg = PageMessage::from_json(r#"{"type":"SYNC_NOW","queueName":"project-submissions"}"#)
            .unwrap();
        assert_eq!(
            msg,
            PageMessage::SyncNow {
                queue_name: "project-submissions".into()
            }
        );
    }

    #[test]
    fn malformed_message_is_rejected() {
        let err = PageMessage::from_json(r#"{"type":"DELETE_ALL"}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn sync_status_wire_format() {
        let msg = ClientMessage::SyncStatus {
            queue_name: "analytics-events".into(),
            success: false,
            processed_count: 2,
            remaining_count: 3,
            error: Some("network error: offline".into()),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "SYNC_STATUS",
                "queueName": "analytics-events",
                "success": false,
                "processedCount": 2,
                "remainingCount": 3,
                "error": "network error: offline"
            })
        );
    }

    #[test]
    fn receipts_wire_format() {
        let ok = EnqueueReceipt::Enqueued {
            queue_name: "analytics-events".into(),
            id: ItemId(7),
            correlation_id: None,
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"type": "ENQUEUED", "queueName": "analytics-events", "id": 7})
        );
        assert_eq!(ok.id(), Some(ItemId(7)));

        let failed = EnqueueReceipt::failed(
            "nope",
            &SyncError::UnknownQueue("nope".into()),
            Some("c-2".into()),
        );
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["type"], "ENQUEUE_FAILED");
        assert_eq!(value["code"], "UNKNOWN_QUEUE");
        assert_eq!(value["correlationId"], "c-2");
        assert!(!failed.is_success());
    }
}
