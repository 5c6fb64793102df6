//! Typed persistence over a [`TransactionalStore`].
//!
//! The scheduler only talks to this layer. It knows how domain types map
//! onto rows and enforces the snapshot TTL and retention rules.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::config::{StorageBackend, StorageConfig};
use crate::domain::{HistoryQuery, HistoryRecord, PersistedSnapshot, Service, Task};
use crate::error::{ResumrError, Result};
use crate::id::generate_record_id;
use crate::store::memory::MemoryStore;
use crate::store::records::{Collection, RecordRow};
use crate::store::sqlite::SqliteStore;
use crate::store::traits::TransactionalStore;

/// Snapshots older than this are never restored.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Age past which history and service snapshots are deleted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

const KIND_FULL: &str = "full";
const KIND_SERVICE: &str = "service";
const FULL_SNAPSHOT_ID: &str = "snapshot-full";

/// Rows removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub service_snapshots: usize,
    pub history: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.service_snapshots + self.history
    }
}

/// Row counts per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub service_snapshots: usize,
    pub queue_items: usize,
    pub history: usize,
}

#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn TransactionalStore>,
    snapshot_ttl: Duration,
    retention: Duration,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("snapshot_ttl", &self.snapshot_ttl)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl Persistence {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            snapshot_ttl: DEFAULT_SNAPSHOT_TTL,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Open the backend named in `config` with its TTL and retention.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn TransactionalStore> = match config.backend {
            StorageBackend::Sqlite => Arc::new(SqliteStore::open_at(&config.path)?),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(store)
            .with_snapshot_ttl(config.snapshot_ttl())
            .with_retention(config.retention()))
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn snapshot_ttl(&self) -> Duration {
        self.snapshot_ttl
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    // --- Queue ---

    /// Rewrite the queue mirror to exactly `tasks`, in order.
    pub fn replace_queue(&self, tasks: &[Task], now: i64) -> Result<()> {
        let rows = tasks
            .iter()
            .map(|task| {
                Ok(RecordRow::new(&task.id, now, serde_json::to_string(task)?)
                    .with_index("priority", task.priority.as_str())
                    .with_index("status", task.status.as_str()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.replace_all(Collection::QueueItems, &rows)
    }

    pub fn load_queue(&self) -> Result<Vec<Task>> {
        self.store
            .list(Collection::QueueItems)?
            .into_iter()
            .map(|row| Ok(serde_json::from_str(&row.json)?))
            .collect()
    }

    // --- Snapshots ---

    /// Store `snapshot` as the single current full snapshot.
    pub fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let row = RecordRow::new(FULL_SNAPSHOT_ID, snapshot.timestamp, serde_json::to_string(snapshot)?)
            .with_index("kind", KIND_FULL);
        self.store
            .replace_where(Collection::ServiceSnapshots, "kind", KIND_FULL, &row)
    }

    /// Newest full snapshot, unless it is older than the TTL.
    ///
    /// A stale snapshot is purged and `None` returned.
    pub fn load_latest_snapshot(&self, now: i64) -> Result<Option<PersistedSnapshot>> {
        let Some(row) = self
            .store
            .latest_where(Collection::ServiceSnapshots, "kind", KIND_FULL)?
        else {
            return Ok(None);
        };

        let snapshot: PersistedSnapshot = serde_json::from_str(&row.json)?;
        let age = snapshot.age_ms(now);
        if age >= self.snapshot_ttl.as_millis() as i64 {
            let purged = self
                .store
                .delete_where(Collection::ServiceSnapshots, "kind", KIND_FULL)?;
            info!(
                "Discarded stale snapshot (age {}s, {} live tasks, {} rows purged)",
                age / 1000,
                snapshot.live_task_count(),
                purged
            );
            return Ok(None);
        }

        debug!("Loaded snapshot from {} ({}s old)", snapshot.timestamp, age / 1000);
        Ok(Some(snapshot))
    }

    /// Append one status row per service.
    pub fn record_service_states(&self, services: &[Service], now: i64) -> Result<()> {
        let rows = services
            .iter()
            .map(|service| {
                Ok(RecordRow::new(generate_record_id("service", now), now, serde_json::to_string(service)?)
                    .with_index("kind", KIND_SERVICE)
                    .with_index("service_id", &service.id))
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.append_many(Collection::ServiceSnapshots, &rows)
    }

    /// Stored status rows for one service, newest first.
    pub fn service_history(&self, service_id: &str) -> Result<Vec<(i64, Service)>> {
        let mut entries = self
            .store
            .query_by_index(Collection::ServiceSnapshots, "service_id", service_id)?
            .into_iter()
            .filter(|row| row.index("kind") == Some(KIND_SERVICE))
            .map(|row| Ok((row.timestamp, serde_json::from_str(&row.json)?)))
            .collect::<Result<Vec<(i64, Service)>>>()?;
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries)
    }

    // --- History ---

    pub fn append_history(&self, record: &HistoryRecord) -> Result<()> {
        let row = RecordRow::new(&record.task.id, record.archived_at, serde_json::to_string(record)?)
            .with_index("status", record.status().as_str())
            .with_index("service_id", &record.task.service_id);
        self.store.append(Collection::History, &row)
    }

    /// History matching `query`, newest first.
    pub fn query_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let rows = match (&query.status, &query.service_id) {
            (Some(status), _) => self
                .store
                .query_by_index(Collection::History, "status", status.as_str())?,
            (None, Some(service_id)) => self
                .store
                .query_by_index(Collection::History, "service_id", service_id)?,
            (None, None) => self.store.list(Collection::History)?,
        };

        let mut records = rows
            .into_iter()
            .filter(|row| {
                query
                    .service_id
                    .as_deref()
                    .is_none_or(|service_id| row.index("service_id") == Some(service_id))
            })
            .filter(|row| query.since.is_none_or(|since| row.timestamp >= since))
            .map(|row| Ok(serde_json::from_str(&row.json)?))
            .collect::<Result<Vec<HistoryRecord>>>()?;

        records.sort_by(|a, b| b.archived_at.cmp(&a.archived_at));
        records.truncate(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
        Ok(records)
    }

    // --- Maintenance ---

    /// Delete rows with `timestamp < cutoff`. Refused on the live queue.
    pub fn delete_older_than(&self, collection: Collection, cutoff: i64) -> Result<usize> {
        if collection == Collection::QueueItems {
            return Err(ResumrError::InvalidState(
                "Refusing age-based deletion on the live queue".to_string(),
            ));
        }
        self.store.delete_older_than(collection, cutoff)
    }

    /// Apply the retention window to snapshots and history.
    pub fn cleanup(&self, now: i64) -> Result<CleanupReport> {
        let cutoff = now - self.retention.as_millis() as i64;
        let report = CleanupReport {
            service_snapshots: self.delete_older_than(Collection::ServiceSnapshots, cutoff)?,
            history: self.delete_older_than(Collection::History, cutoff)?,
        };
        if report.total() > 0 {
            info!(
                "Retention cleanup removed {} snapshot rows and {} history rows",
                report.service_snapshots, report.history
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            service_snapshots: self.store.count(Collection::ServiceSnapshots)?,
            queue_items: self.store.count(Collection::QueueItems)?,
            history: self.store.count(Collection::History)?,
        })
    }
}
