use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::SyncError;

/// Validated queue name - immutable after construction.
///
/// Lowercase only: the name becomes part of a SQLite identifier, and those
/// compare case-insensitively.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub const MAX_LENGTH: usize = 64;

    pub fn new(name: impl Into<String>) -> Result<Self, SyncError> {
        let name = name.into().trim().to_string();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), SyncError> {
        if name.is_empty() {
            return Err(SyncError::InvalidQueueName(
                "queue name cannot be empty".into(),
            ));
        }
        if name.len() > Self::MAX_LENGTH {
            return Err(SyncError::InvalidQueueName(format!(
                "queue name exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(SyncError::InvalidQueueName(format!(
                "'{name}' contains invalid characters (allowed: a-z, 0-9, -, _)"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for QueueName {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

/// Per-queue item identifier. Strictly increasing within a queue, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn saturating_sub_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    #[must_use]
    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

/// One unit of pending work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub enqueued_at: UnixTimeMs,
    pub attempts: u32,
}

impl QueueItem {
    /// Retention deadline: the item is swept once `now` reaches it.
    pub fn expires_at(&self, retention_ms: u64) -> UnixTimeMs {
        self.enqueued_at.saturating_add_ms(retention_ms)
    }

    pub fn is_expired(&self, now: UnixTimeMs, retention_ms: u64) -> bool {
        now >= self.expires_at(retention_ms)
    }
}

/// Per-item reconciliation of one submitted batch. Lives for one dispatch
/// cycle only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub acknowledged: BTreeSet<ItemId>,
    pub rejected: BTreeSet<ItemId>,
    pub retry: BTreeSet<ItemId>,
}

impl SyncOutcome {
    pub fn all_acknowledged(batch: &[QueueItem]) -> Self {
        Self {
            acknowledged: batch.iter().map(|item| item.id).collect(),
            ..Self::default()
        }
    }

    pub fn all_rejected(batch: &[QueueItem]) -> Self {
        Self {
            rejected: batch.iter().map(|item| item.id).collect(),
            ..Self::default()
        }
    }

    /// Ids that leave the store: acknowledged plus terminally rejected.
    pub fn removable(&self) -> Vec<ItemId> {
        self.acknowledged
            .iter()
            .chain(self.rejected.iter())
            .copied()
            .collect()
    }

    pub fn processed_count(&self) -> usize {
        self.acknowledged.len() + self.rejected.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: u64) -> QueueItem {
        QueueItem {
            id: ItemId(id),
            queue: QueueName::new("analytics-events").unwrap(),
            payload: json!({ "n": id }),
            enqueued_at: UnixTimeMs(1_700_000_000_000),
            attempts: 0,
        }
    }

    #[test]
    fn queue_name_validation() {
        assert!(QueueName::new("analytics-events").is_ok());
        assert!(QueueName::new("project_submissions2").is_ok());
        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("   ").is_err());
        assert!(QueueName::new("Analytics").is_err());
        assert!(QueueName::new("drop table;").is_err());
        assert!(QueueName::new("a\"b").is_err());
        assert!(QueueName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn queue_name_trims_whitespace() {
        let name = QueueName::new("  analytics-events ").unwrap();
        assert_eq!(name.as_str(), "analytics-events");
    }

    #[test]
    fn queue_name_deserialize_validates() {
        let ok: Result<QueueName, _> = serde_json::from_str("\"analytics-events\"");
        assert!(ok.is_ok());
        let bad: Result<QueueName, _> = serde_json::from_str("\"Bad Name\"");
        assert!(bad.is_err());
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let item = item(1);
        let horizon = 1_000;
        assert!(!item.is_expired(UnixTimeMs(item.enqueued_at.0 + 999), horizon));
        assert!(item.is_expired(UnixTimeMs(item.enqueued_at.0 + 1_000), horizon));
    }

    #[test]
    fn outcome_removable_excludes_retry() {
        let outcome = SyncOutcome {
            acknowledged: [ItemId(1), ItemId(3)].into_iter().collect(),
            rejected: [ItemId(2)].into_iter().collect(),
            retry: [ItemId(4)].into_iter().collect(),
        };
        let mut removable = outcome.removable();
        removable.sort();
        assert_eq!(removable, vec![ItemId(1), ItemId(2), ItemId(3)]);
        assert_eq!(outcome.processed_count(), 3);
    }

    #[test]
    fn whole_batch_outcomes() {
        let batch = vec![item(1), item(2)];
        assert_eq!(SyncOutcome::all_acknowledged(&batch).acknowledged.len(), 2);
        assert_eq!(SyncOutcome::all_rejected(&batch).rejected.len(), 2);
    }
}
