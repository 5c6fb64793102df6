//! In-memory store for tests and `backend: memory`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{ResumrError, Result};
use crate::store::records::{Collection, RecordRow};
use crate::store::traits::TransactionalStore;

/// Vec-per-collection store. Same id replaces the row in place.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<Collection, Vec<RecordRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Collection, Vec<RecordRow>>>> {
        self.collections.lock().map_err(|e| ResumrError::Storage(e.to_string()))
    }

    fn upsert(rows: &mut Vec<RecordRow>, row: &RecordRow) {
        match rows.iter_mut().find(|existing| existing.id == row.id) {
            Some(existing) => *existing = row.clone(),
            None => rows.push(row.clone()),
        }
    }
}

impl TransactionalStore for MemoryStore {
    fn replace_all(&self, collection: Collection, rows: &[RecordRow]) -> Result<()> {
        for row in rows {
            row.validate_for(collection)?;
        }
        let mut collections = self.lock()?;
        let target = collections.entry(collection).or_default();
        target.clear();
        for row in rows {
            Self::upsert(target, row);
        }
        Ok(())
    }

    fn replace_where(&self, collection: Collection, index: &str, value: &str, row: &RecordRow) -> Result<()> {
        collection.validate_index(index)?;
        row.validate_for(collection)?;
        let mut collections = self.lock()?;
        let target = collections.entry(collection).or_default();
        target.retain(|existing| existing.index(index) != Some(value));
        Self::upsert(target, row);
        Ok(())
    }

    fn append_many(&self, collection: Collection, rows: &[RecordRow]) -> Result<()> {
        for row in rows {
            row.validate_for(collection)?;
        }
        let mut collections = self.lock()?;
        let target = collections.entry(collection).or_default();
        for row in rows {
            Self::upsert(target, row);
        }
        Ok(())
    }

    fn list(&self, collection: Collection) -> Result<Vec<RecordRow>> {
        Ok(self.lock()?.get(&collection).cloned().unwrap_or_default())
    }

    fn query_by_index(&self, collection: Collection, index: &str, value: &str) -> Result<Vec<RecordRow>> {
        collection.validate_index(index)?;
        let collections = self.lock()?;
        Ok(collections
            .get(&collection)
            .map(|rows| rows.iter().filter(|r| r.index(index) == Some(value)).cloned().collect())
            .unwrap_or_default())
    }

    fn latest_where(&self, collection: Collection, index: &str, value: &str) -> Result<Option<RecordRow>> {
        let rows = self.query_by_index(collection, index, value)?;
        // max_by_key keeps the last of equal keys, matching rowid DESC tie-breaking
        Ok(rows.into_iter().max_by_key(|r| r.timestamp))
    }

    fn delete_where(&self, collection: Collection, index: &str, value: &str) -> Result<usize> {
        collection.validate_index(index)?;
        let mut collections = self.lock()?;
        let Some(rows) = collections.get_mut(&collection) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| r.index(index) != Some(value));
        Ok(before - rows.len())
    }

    fn delete_older_than(&self, collection: Collection, cutoff: i64) -> Result<usize> {
        let mut collections = self.lock()?;
        let Some(rows) = collections.get_mut(&collection) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| r.timestamp >= cutoff);
        Ok(before - rows.len())
    }

    fn clear(&self, collection: Collection) -> Result<usize> {
        let mut collections = self.lock()?;
        Ok(collections.remove(&collection).map(|rows| rows.len()).unwrap_or(0))
    }

    fn count(&self, collection: Collection) -> Result<usize> {
        Ok(self.lock()?.get(&collection).map(Vec::len).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, ts: i64, status: &str) -> RecordRow {
        RecordRow::new(id, ts, "{}".to_string()).with_index("status", status)
    }

    #[test]
    fn test_append_replaces_same_id() {
        let store = MemoryStore::new();
        store.append(Collection::History, &row("a", 1, "failed")).unwrap();
        store.append(Collection::History, &row("a", 2, "completed")).unwrap();

        let rows = store.list(Collection::History).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].index("status"), Some("completed"));
    }

    #[test]
    fn test_delete_older_than() {
        let store = MemoryStore::new();
        store
            .append_many(Collection::History, &[row("a", 5, "failed"), row("b", 10, "failed")])
            .unwrap();
        assert_eq!(store.delete_older_than(Collection::History, 10).unwrap(), 1);
        assert_eq!(store.count(Collection::History).unwrap(), 1);
    }

    #[test]
    fn test_latest_where_ties_prefer_last_inserted() {
        let store = MemoryStore::new();
        store
            .append_many(Collection::History, &[row("a", 5, "failed"), row("b", 5, "failed")])
            .unwrap();
        let latest = store.latest_where(Collection::History, "status", "failed").unwrap().unwrap();
        assert_eq!(latest.id, "b");
    }

    #[test]
    fn test_rejects_undeclared_index() {
        let store = MemoryStore::new();
        let bad = RecordRow::new("x", 0, "{}".to_string()).with_index("kind", "full");
        assert!(store.append(Collection::History, &bad).is_err());
        assert_eq!(store.count(Collection::History).unwrap(), 0);
    }
}
