use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::{QueueStore, StoreError};
use crate::model::{ItemId, QueueItem, QueueName, UnixTimeMs};

const TABLE_PREFIX: &str = "q_";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

struct Inner {
    conn: Connection,
    tables: HashSet<QueueName>,
    quarantined: BTreeMap<(QueueName, ItemId), String>,
}

impl Inner {
    fn ensure_table(&mut self, queue: &QueueName) -> Result<String, StoreError> {
        let table = table_ident(queue);
        if self.tables.contains(queue) {
            return Ok(table);
        }

        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload BLOB NOT NULL,
                checksum BLOB NOT NULL,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS "idx_{TABLE_PREFIX}{name}_enqueued_at"
                ON {table}(enqueued_at);
            "#,
            name = queue.as_str(),
        ))?;

        self.tables.insert(queue.clone());
        Ok(table)
    }
}

/// Quoted identifier of a queue's table. Queue names are restricted to
/// `[a-z0-9_-]`, so no escaping is needed.
fn table_ident(queue: &QueueName) -> String {
    format!("\"{TABLE_PREFIX}{}\"", queue.as_str())
}

fn encode_payload(payload: &serde_json::Value) -> Result<(Vec<u8>, [u8; 32]), StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(payload, &mut bytes)?;
    let checksum = *blake3::hash(&bytes).as_bytes();
    Ok((bytes, checksum))
}

fn decode_payload(
    queue: &QueueName,
    id: ItemId,
    bytes: &[u8],
    checksum: &[u8],
) -> Result<serde_json::Value, StoreError> {
    let actual = blake3::hash(bytes);
    if actual.as_bytes().as_slice() != checksum {
        return Err(StoreError::Corrupted {
            queue: queue.clone(),
            id,
            reason: format!(
                "checksum mismatch: expected {}, got {}",
                hex::encode(checksum),
                actual.to_hex()
            ),
        });
    }
    ciborium::from_reader(bytes).map_err(|e| StoreError::Corrupted {
        queue: queue.clone(),
        id,
        reason: format!("payload decode failed: {e}"),
    })
}

/// SQLite-backed [`QueueStore`]: one table per queue, WAL journal,
/// `synchronous = FULL`. Blocking calls run on the tokio blocking pool.
pub struct SqliteQueueStore {
    inner: Arc<Mutex<Inner>>,
    path: Option<PathBuf>,
}

impl SqliteQueueStore {
    /// Opens or creates the database at `path`. Any failure here is
    /// reported as [`StoreError::Unavailable`]; there is no in-memory
    /// fallback.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || Self::connect(&open_path))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
            .map_err(|e| {
                error!(error = %e, "Failed to open queue database");
                e
            })?;

        info!("Queue database opened");
        Ok(Self::from_connection(conn, Some(path)))
    }

    /// Volatile store for tests and ephemeral hosts.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(conn, None))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Rows skipped by `list_pending` because their checksum or encoding
    /// failed, with the reason. They stay on disk until the retention sweep.
    pub fn quarantined(&self) -> Vec<(QueueName, ItemId, String)> {
        match self.inner.lock() {
            Ok(inner) => inner
                .quarantined
                .iter()
                .map(|((queue, id), reason)| (queue.clone(), *id, reason.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn connect(path: &Path) -> Result<Connection, StoreError> {
        let unavailable = |e: rusqlite::Error| StoreError::Unavailable(e.to_string());

        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(unavailable)?;
        conn.execute_batch("PRAGMA synchronous = FULL;")
            .map_err(unavailable)?;
        Ok(conn)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                tables: HashSet::new(),
                quarantined: BTreeMap::new(),
            })),
            path,
        }
    }

    async fn with_inner<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Inner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| StoreError::LockFailed)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Storage(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn open(&self, queue: &QueueName) -> Result<(), StoreError> {
        let queue = queue.clone();
        self.with_inner(move |inner| inner.ensure_table(&queue).map(|_| ()))
            .await
    }

    #[instrument(skip(self, payload), fields(queue = %queue))]
    async fn enqueue(
        &self,
        queue: &QueueName,
        payload: &serde_json::Value,
        now: UnixTimeMs,
    ) -> Result<ItemId, StoreError> {
        let (bytes, checksum) = encode_payload(payload)?;
        let queue = queue.clone();

        self.with_inner(move |inner| {
            let table = inner.ensure_table(&queue)?;
            inner.conn.execute(
                &format!(
                    "INSERT INTO {table} (payload, checksum, enqueued_at, attempts) \
                     VALUES (?1, ?2, ?3, 0)"
                ),
                params![bytes, checksum.as_slice(), now.0 as i64],
            )?;
            Ok(ItemId(inner.conn.last_insert_rowid() as u64))
        })
        .await
    }

    #[instrument(skip(self), fields(queue = %queue))]
    async fn list_pending(&self, queue: &QueueName) -> Result<Vec<QueueItem>, StoreError> {
        let queue = queue.clone();

        self.with_inner(move |inner| {
            let table = inner.ensure_table(&queue)?;
            let rows = {
                let mut stmt = inner.conn.prepare(&format!(
                    "SELECT id, payload, checksum, enqueued_at, attempts \
                     FROM {table} ORDER BY id ASC"
                ))?;
                let mapped = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?;
                mapped.collect::<Result<Vec<_>, _>>()?
            };

            let mut items = Vec::with_capacity(rows.len());
            for (id, bytes, checksum, enqueued_at, attempts) in rows {
                let id = ItemId(id as u64);
                match decode_payload(&queue, id, &bytes, &checksum) {
                    Ok(payload) => items.push(QueueItem {
                        id,
                        queue: queue.clone(),
                        payload,
                        enqueued_at: UnixTimeMs(enqueued_at.max(0) as u64),
                        attempts: u32::try_from(attempts.max(0)).unwrap_or(u32::MAX),
                    }),
                    Err(e) => {
                        warn!(item_id = %id, error = %e, "Quarantining unreadable queue item");
                        inner
                            .quarantined
                            .insert((queue.clone(), id), e.to_string());
                    }
                }
            }
            Ok(items)
        })
        .await
    }

    #[instrument(skip(self, ids), fields(queue = %queue, count = ids.len()))]
    async fn remove(&self, queue: &QueueName, ids: &[ItemId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let queue = queue.clone();
        let ids = ids.to_vec();

        self.with_inner(move |inner| {
            let table = inner.ensure_table(&queue)?;
            let tx = inner.conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare(&format!("DELETE FROM {table} WHERE id = ?1"))?;
                for id in &ids {
                    removed += stmt.execute(params![id.0 as i64])?;
                }
            }
            tx.commit()?;
            for id in &ids {
                inner.quarantined.remove(&(queue.clone(), *id));
            }
            Ok(removed)
        })
        .await
    }

    #[instrument(skip(self, ids), fields(queue = %queue, count = ids.len()))]
    async fn increment_attempts(&self, queue: &QueueName, ids: &[ItemId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let queue = queue.clone();
        let ids = ids.to_vec();

        self.with_inner(move |inner| {
            let table = inner.ensure_table(&queue)?;
            let tx = inner.conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE {table} SET attempts = attempts + 1 WHERE id = ?1"
                ))?;
                for id in &ids {
                    stmt.execute(params![id.0 as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(queue = %queue, cutoff = cutoff.0))]
    async fn purge_expired(
        &self,
        queue: &QueueName,
        cutoff: UnixTimeMs,
    ) -> Result<Vec<ItemId>, StoreError> {
        let queue = queue.clone();

        self.with_inner(move |inner| {
            let table = inner.ensure_table(&queue)?;
            let cutoff = i64::try_from(cutoff.0).unwrap_or(i64::MAX);
            let tx = inner.conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT id FROM {table} WHERE enqueued_at <= ?1 ORDER BY id ASC"
                ))?;
                let ids = stmt
                    .query_map(params![cutoff], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids.into_iter().map(|id| ItemId(id as u64)).collect::<Vec<_>>()
            };
            tx.execute(
                &format!("DELETE FROM {table} WHERE enqueued_at <= ?1"),
                params![cutoff],
            )?;
            tx.commit()?;
            for id in &ids {
                inner.quarantined.remove(&(queue.clone(), *id));
            }
            Ok(ids)
        })
        .await
    }

    async fn pending_count(&self, queue: &QueueName) -> Result<usize, StoreError> {
        let queue = queue.clone();

        self.with_inner(move |inner| {
            let table = inner.ensure_table(&queue)?;
            let count: i64 =
                inner
                    .conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                        row.get(0)
                    })?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    async fn queues(&self) -> Result<Vec<QueueName>, StoreError> {
        self.with_inner(|inner| {
            let mut stmt = inner.conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name ASC",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(names
                .into_iter()
                .filter_map(|name| {
                    name.strip_prefix(TABLE_PREFIX)
                        .and_then(|rest| QueueName::new(rest).ok())
                })
                .collect())
        })
        .await
    }
}

impl SqliteQueueStore {
    /// Highest id ever handed out for `queue`, from SQLite's AUTOINCREMENT
    /// bookkeeping. `None` before the first enqueue.
    pub async fn last_assigned_id(&self, queue: &QueueName) -> Result<Option<ItemId>, StoreError> {
        let queue = queue.clone();
        self.with_inner(move |inner| {
            inner.ensure_table(&queue)?;
            let seq: Option<i64> = inner
                .conn
                .query_row(
                    "SELECT seq FROM sqlite_sequence WHERE name = ?1",
                    params![format!("{TABLE_PREFIX}{}", queue.as_str())],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq.map(|s| ItemId(s as u64)))
        })
        .await
    }
}
