use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::error::SyncError;
use crate::model::{QueueItem, QueueName, SyncOutcome};

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_RESPONSE_BODY_SIZE: usize = 4 * 1024 * 1024;
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Statuses that mean "try again later" even though they sit in the 4xx range.
pub const RETRYABLE_CLIENT_STATUSES: [u16; 2] = [408, 429];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Endpoint URL checked once at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    scheme: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(TransportError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }
        if trimmed.len() > MAX_URL_LENGTH {
            return Err(TransportError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(trimmed).map_err(|e| TransportError::InvalidUrl {
            url: Self::truncate_url(trimmed),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(TransportError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
            });
        }

        let host = match parsed.host_str() {
            Some(host) => host.to_lowercase(),
            None => {
                return Err(TransportError::InvalidUrl {
                    url: Self::truncate_url(trimmed),
                    reason: "URL must have a host".to_string(),
                })
            }
        };

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(TransportError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(Self {
            url: parsed.to_string(),
            scheme,
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn truncate_url(url: &str) -> String {
        match url.char_indices().nth(100) {
            Some((cut, _)) => format!("{}...", &url[..cut]),
            None => url.to_string(),
        }
    }
}

/// Classified result of one batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResult {
    /// The server answered 2xx. Per-item outcome, possibly all acknowledged.
    Delivered(SyncOutcome),
    /// Terminal rejection of the whole batch.
    Rejected { status: u16, message: String },
    /// Nothing is known about the batch: keep it and stop the cycle.
    Retryable(SyncError),
}

/// Request body posted to a queue endpoint. Item ids are not sent.
#[derive(Debug, Serialize)]
pub struct BatchRequest<'a> {
    pub events: Vec<&'a serde_json::Value>,
}

impl<'a> BatchRequest<'a> {
    pub fn from_batch(batch: &'a [QueueItem]) -> Self {
        Self {
            events: batch.iter().map(|item| &item.payload).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    accepted: Option<Vec<usize>>,
    rejected: Option<Vec<usize>>,
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_CLIENT_STATUSES.contains(&status) || !(400..500).contains(&status)
}

/// Maps an HTTP status and response body onto a [`TransportResult`].
///
/// Indices in `accepted`/`rejected` refer to positions in `batch`. An index
/// listed in neither is retried; an index listed in both counts as accepted.
pub fn classify_response(status: u16, body: &[u8], batch: &[QueueItem]) -> TransportResult {
    if (200..300).contains(&status) {
        return TransportResult::Delivered(parse_outcome(body, batch));
    }

    if is_retryable_status(status) {
        return TransportResult::Retryable(SyncError::TransportNetwork(format!(
            "server responded with status {status}"
        )));
    }

    TransportResult::Rejected {
        status,
        message: response_message(body),
    }
}

fn parse_outcome(body: &[u8], batch: &[QueueItem]) -> SyncOutcome {
    let parsed = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<BatchResponse>(body).ok()
    };

    let response = match parsed {
        Some(r) if r.accepted.is_some() || r.rejected.is_some() => r,
        _ => return SyncOutcome::all_acknowledged(batch),
    };

    let accepted = collect_indices(response.accepted.unwrap_or_default(), batch.len(), "accepted");
    let rejected = collect_indices(response.rejected.unwrap_or_default(), batch.len(), "rejected");

    let mut outcome = SyncOutcome::default();
    for (index, item) in batch.iter().enumerate() {
        if accepted.contains(&index) {
            outcome.acknowledged.insert(item.id);
        } else if rejected.contains(&index) {
            outcome.rejected.insert(item.id);
        } else {
            outcome.retry.insert(item.id);
        }
    }
    outcome
}

fn collect_indices(indices: Vec<usize>, len: usize, field: &str) -> BTreeSet<usize> {
    indices
        .into_iter()
        .filter(|&index| {
            let in_range = index < len;
            if !in_range {
                warn!(index, batch_len = len, field, "Ignoring out-of-range index in sync response");
            }
            in_range
        })
        .collect()
}

fn response_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "no response body".to_string();
    }
    match text.char_indices().nth(200) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Network seam of the dispatcher. Implementations never retry internally.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, queue: &QueueName, batch: &[QueueItem]) -> TransportResult;
}

#[cfg(feature = "http")]
pub use self::http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tracing::{debug, instrument, warn};
    use uuid::Uuid;

    use super::{
        classify_response, BatchRequest, Transport, TransportError, TransportResult, ValidatedUrl,
        MAX_RESPONSE_BODY_SIZE, REQUEST_ID_HEADER,
    };
    use crate::config::SyncConfig;
    use crate::error::SyncError;
    use crate::model::{QueueItem, QueueName};

    /// `reqwest`-backed transport posting each batch to its queue's endpoint.
    pub struct HttpTransport {
        client: reqwest::Client,
        endpoints: HashMap<QueueName, ValidatedUrl>,
        timeout: Duration,
        max_response_size: usize,
    }

    impl HttpTransport {
        pub fn from_config(config: &SyncConfig) -> Result<Self, TransportError> {
            let timeout = config.transport_timeout();
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportError::Client(e.to_string()))?;

            let endpoints = config
                .queues
                .iter()
                .map(|q| Ok((q.name.clone(), ValidatedUrl::new(&q.endpoint)?)))
                .collect::<Result<HashMap<_, _>, TransportError>>()?;

            Ok(Self {
                client,
                endpoints,
                timeout,
                max_response_size: MAX_RESPONSE_BODY_SIZE,
            })
        }

        /// Caps how much of a response body is read; never above
        /// [`MAX_RESPONSE_BODY_SIZE`].
        pub fn with_max_response_size(mut self, max_bytes: usize) -> Self {
            self.max_response_size = max_bytes.min(MAX_RESPONSE_BODY_SIZE);
            self
        }

        pub fn max_response_size(&self) -> usize {
            self.max_response_size
        }

        fn oversized_body(&self) -> SyncError {
            SyncError::TransportNetwork(format!(
                "response body exceeds {} bytes",
                self.max_response_size
            ))
        }

        /// Reads the body chunk by chunk, giving up as soon as it passes the
        /// size cap.
        async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>, SyncError> {
            if response
                .content_length()
                .is_some_and(|len| len > self.max_response_size as u64)
            {
                return Err(self.oversized_body());
            }

            let mut body = Vec::new();
            while let Some(chunk) = response.chunk().await.map_err(|e| self.network_error(e))? {
                if body.len() + chunk.len() > self.max_response_size {
                    return Err(self.oversized_body());
                }
                body.extend_from_slice(&chunk);
            }
            Ok(body)
        }

        pub fn endpoint(&self, queue: &QueueName) -> Option<&ValidatedUrl> {
            self.endpoints.get(queue)
        }

        fn network_error(&self, err: reqwest::Error) -> SyncError {
            if err.is_timeout() {
                SyncError::TransportTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                SyncError::TransportNetwork(err.to_string())
            }
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        #[instrument(skip(self, batch), fields(queue = %queue, batch_len = batch.len()))]
        async fn send(&self, queue: &QueueName, batch: &[QueueItem]) -> TransportResult {
            let Some(endpoint) = self.endpoints.get(queue) else {
                return TransportResult::Retryable(SyncError::UnknownQueue(queue.to_string()));
            };

            let request_id = Uuid::new_v4().to_string();
            let response = self
                .client
                .post(endpoint.as_str())
                .header(REQUEST_ID_HEADER, &request_id)
                .json(&BatchRequest::from_batch(batch))
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => return TransportResult::Retryable(self.network_error(e)),
            };

            let status = response.status().as_u16();
            let body = match self.read_body(response).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(%request_id, status, error = %e, "Discarding sync batch response");
                    return TransportResult::Retryable(e);
                }
            };

            debug!(%request_id, status, "Sync batch response received");
            classify_response(status, &body, batch)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::ItemId;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Canned server behaviour for one `send`.
    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        Http { status: u16, body: String },
        Network,
    }

    impl Reply {
        pub(crate) fn ok() -> Self {
            Reply::Http {
                status: 200,
                body: String::new(),
            }
        }

        pub(crate) fn status(status: u16) -> Self {
            Reply::Http {
                status,
                body: String::new(),
            }
        }

        pub(crate) fn json(status: u16, body: serde_json::Value) -> Self {
            Reply::Http {
                status,
                body: body.to_string(),
            }
        }
    }

    /// Plays back scripted replies in order, then `fallback` forever.
    /// Records every call.
    pub(crate) struct ScriptedTransport {
        script: Mutex<VecDeque<Reply>>,
        fallback: Reply,
        delay: Option<Duration>,
        calls: Mutex<Vec<(QueueName, Vec<ItemId>)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(fallback: Reply) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback,
                delay: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn accepting() -> Self {
            Self::new(Reply::ok())
        }

        pub(crate) fn with_script(self, replies: impl IntoIterator<Item = Reply>) -> Self {
            self.script.lock().unwrap().extend(replies);
            self
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn calls(&self) -> Vec<(QueueName, Vec<ItemId>)> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, queue: &QueueName, batch: &[QueueItem]) -> TransportResult {
            self.calls
                .lock()
                .unwrap()
                .push((queue.clone(), batch.iter().map(|i| i.id).collect()));
            let reply = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Http { status, body } => classify_response(status, body.as_bytes(), batch),
                Reply::Network => TransportResult::Retryable(SyncError::TransportNetwork(
                    "connection refused".into(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemId, UnixTimeMs};
    use serde_json::json;

    fn batch(n: u64) -> Vec<QueueItem> {
        (1..=n)
            .map(|id| QueueItem {
                id: ItemId(id),
                queue: QueueName::new("analytics-events").unwrap(),
                payload: json!({ "seq": id }),
                enqueued_at: UnixTimeMs(1_700_000_000_000),
                attempts: 1,
            })
            .collect()
    }

    fn ids(raw: &[u64]) -> BTreeSet<ItemId> {
        raw.iter().map(|&id| ItemId(id)).collect()
    }

    #[test]
    fn test_url_validation_valid() {
        let url = ValidatedUrl::new("https://api.example.com/v1/events").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host(), "api.example.com");
    }

    #[test]
    fn test_url_validation_rejects_bad_input() {
        assert!(ValidatedUrl::new("").is_err());
        assert!(ValidatedUrl::new("   ").is_err());
        assert!(ValidatedUrl::new("ftp://example.com/x").is_err());
        assert!(ValidatedUrl::new("https://user:pw@example.com/x").is_err());
        assert!(ValidatedUrl::new("not a url").is_err());
        let long_url = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(ValidatedUrl::new(long_url).is_err());
    }

    #[test]
    fn test_bare_200_acknowledges_everything() {
        let batch = batch(3);
        let result = classify_response(200, b"", &batch);
        assert_eq!(
            result,
            TransportResult::Delivered(SyncOutcome::all_acknowledged(&batch))
        );
    }

    #[test]
    fn test_unstructured_2xx_body_acknowledges_everything() {
        let batch = batch(2);
        let bodies: [&[u8]; 3] = [b"ok", br#"{"status":"fine"}"#, b"[1,2]"];
        for body in bodies {
            match classify_response(202, body, &batch) {
                TransportResult::Delivered(outcome) => {
                    assert_eq!(outcome.acknowledged, ids(&[1, 2]));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_structured_outcome_maps_indices_to_ids() {
        let batch = batch(4);
        let body = json!({ "accepted": [0, 2], "rejected": [1] }).to_string();
        let TransportResult::Delivered(outcome) = classify_response(200, body.as_bytes(), &batch)
        else {
            panic!("expected delivered");
        };
        assert_eq!(outcome.acknowledged, ids(&[1, 3]));
        assert_eq!(outcome.rejected, ids(&[2]));
        assert_eq!(outcome.retry, ids(&[4]));
    }

    #[test]
    fn test_out_of_range_indices_are_ignored() {
        let batch = batch(2);
        let body = json!({ "accepted": [0, 1, 7], "rejected": [99] }).to_string();
        let TransportResult::Delivered(outcome) = classify_response(200, body.as_bytes(), &batch)
        else {
            panic!("expected delivered");
        };
        assert_eq!(outcome.acknowledged, ids(&[1, 2]));
        assert!(outcome.rejected.is_empty());
        assert!(outcome.retry.is_empty());
    }

    #[test]
    fn test_index_in_both_lists_counts_as_accepted() {
        let batch = batch(1);
        let body = json!({ "accepted": [0], "rejected": [0] }).to_string();
        let TransportResult::Delivered(outcome) = classify_response(200, body.as_bytes(), &batch)
        else {
            panic!("expected delivered");
        };
        assert_eq!(outcome.acknowledged, ids(&[1]));
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_4xx_rejects_whole_batch() {
        let batch = batch(2);
        match classify_response(422, b"schema mismatch", &batch) {
            TransportResult::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "schema mismatch");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_retryable_statuses() {
        let batch = batch(1);
        for status in [408, 429, 500, 502, 503, 504, 302] {
            assert!(
                matches!(
                    classify_response(status, b"", &batch),
                    TransportResult::Retryable(_)
                ),
                "status {status} should be retryable"
            );
        }
        for status in [400, 401, 403, 404, 409, 413, 422] {
            assert!(!is_retryable_status(status), "status {status}");
        }
    }

    #[test]
    fn test_request_body_carries_payloads_only() {
        let batch = batch(2);
        let body = serde_json::to_value(BatchRequest::from_batch(&batch)).unwrap();
        assert_eq!(body, json!({ "events": [{ "seq": 1 }, { "seq": 2 }] }));
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_transport_from_config() {
        let config = crate::config::SyncConfig::default().with_queue(
            QueueName::new("analytics-events").unwrap(),
            "https://api.example.com/events",
        );
        let transport = HttpTransport::from_config(&config).unwrap();
        let queue = QueueName::new("analytics-events").unwrap();
        assert_eq!(
            transport.endpoint(&queue).map(ValidatedUrl::host),
            Some("api.example.com")
        );
        assert!(transport
            .endpoint(&QueueName::new("other").unwrap())
            .is_none());
    }

    #[cfg(feature = "http")]
    #[tokio::test]
    async fn test_http_transport_unknown_queue_is_retained() {
        let transport = HttpTransport::from_config(&crate::config::SyncConfig::default()).unwrap();
        let queue = QueueName::new("analytics-events").unwrap();
        let result = transport.send(&queue, &batch(1)).await;
        assert!(matches!(
            result,
            TransportResult::Retryable(SyncError::UnknownQueue(_))
        ));
    }
}
