//! SQLite-backed store.
//!
//! One table per collection, each with a timestamp index and the
//! collection's domain indexes. The record body is kept as JSON in
//! `json_data`; indexed fields are duplicated into their own columns so
//! lookups never parse JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::{Connection, Params, params_from_iter};

use crate::error::{ResumrError, Result};
use crate::store::records::{Collection, RecordRow};
use crate::store::traits::TransactionalStore;

/// Database file name inside the store directory.
pub const DB_FILE: &str = "resumr.db";

/// SQLite implementation of [`TransactionalStore`].
///
/// rusqlite's `Connection` is not `Sync`, so it sits behind a `Mutex`.
/// Every operation is short and needs exclusive access anyway.
pub struct SqliteStore {
    db_path: PathBuf,
    db: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a store in the given directory.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let db_path = base_dir.join(DB_FILE);

        let db = Connection::open(&db_path)
            .map_err(|e| ResumrError::Storage(format!("Failed to open {}: {}", db_path.display(), e)))?;

        Self::init_schema(&db)?;

        Ok(Self {
            db_path,
            db: Mutex::new(db),
        })
    }

    /// Path of the underlying database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS service_snapshots (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                service_id TEXT,
                kind TEXT,
                json_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_service_snapshots_timestamp ON service_snapshots(timestamp);
            CREATE INDEX IF NOT EXISTS idx_service_snapshots_service ON service_snapshots(service_id);
            CREATE INDEX IF NOT EXISTS idx_service_snapshots_kind ON service_snapshots(kind);

            CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                priority TEXT,
                status TEXT,
                json_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_items_timestamp ON queue_items(timestamp);
            CREATE INDEX IF NOT EXISTS idx_queue_items_priority ON queue_items(priority);
            CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status);

            CREATE TABLE IF NOT EXISTS history (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                status TEXT,
                service_id TEXT,
                json_data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp);
            CREATE INDEX IF NOT EXISTS idx_history_status ON history(status);
            CREATE INDEX IF NOT EXISTS idx_history_service ON history(service_id);
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|e| ResumrError::Storage(e.to_string()))
    }

    fn select_columns(collection: Collection) -> String {
        let mut columns = vec!["id", "timestamp"];
        columns.extend_from_slice(collection.indexes());
        columns.push("json_data");
        columns.join(", ")
    }

    fn insert_row(db: &Connection, collection: Collection, row: &RecordRow) -> Result<()> {
        row.validate_for(collection)?;
        let indexes = collection.indexes();

        let placeholders: Vec<String> = (1..=indexes.len() + 3).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            collection.table(),
            Self::select_columns(collection),
            placeholders.join(", ")
        );

        let mut values = vec![Value::Text(row.id.clone()), Value::Integer(row.timestamp)];
        for index in indexes {
            values.push(match row.index(index) {
                Some(v) => Value::Text(v.to_string()),
                None => Value::Null,
            });
        }
        values.push(Value::Text(row.json.clone()));

        db.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }

    fn read_rows<P: Params>(db: &Connection, collection: Collection, tail: &str, params: P) -> Result<Vec<RecordRow>> {
        let indexes = collection.indexes();
        let sql = format!(
            "SELECT {} FROM {} {}",
            Self::select_columns(collection),
            collection.table(),
            tail
        );

        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params, |r| {
            let mut row = RecordRow::new(r.get::<_, String>(0)?, r.get(1)?, String::new());
            for (i, index) in indexes.iter().enumerate() {
                let value: Option<String> = r.get(2 + i)?;
                if let Some(value) = value {
                    row.indexes.insert(index.to_string(), value);
                }
            }
            row.json = r.get(2 + indexes.len())?;
            Ok(row)
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

impl TransactionalStore for SqliteStore {
    fn replace_all(&self, collection: Collection, rows: &[RecordRow]) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(&format!("DELETE FROM {}", collection.table()), [])?;
        for row in rows {
            Self::insert_row(&tx, collection, row)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn replace_where(&self, collection: Collection, index: &str, value: &str, row: &RecordRow) -> Result<()> {
        collection.validate_index(index)?;
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", collection.table(), index),
            [value],
        )?;
        Self::insert_row(&tx, collection, row)?;
        tx.commit()?;
        Ok(())
    }

    fn append_many(&self, collection: Collection, rows: &[RecordRow]) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        for row in rows {
            Self::insert_row(&tx, collection, row)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list(&self, collection: Collection) -> Result<Vec<RecordRow>> {
        let db = self.conn()?;
        Self::read_rows(&db, collection, "ORDER BY rowid", [])
    }

    fn query_by_index(&self, collection: Collection, index: &str, value: &str) -> Result<Vec<RecordRow>> {
        collection.validate_index(index)?;
        let db = self.conn()?;
        Self::read_rows(&db, collection, &format!("WHERE {} = ?1 ORDER BY rowid", index), [value])
    }

    fn latest_where(&self, collection: Collection, index: &str, value: &str) -> Result<Option<RecordRow>> {
        collection.validate_index(index)?;
        let db = self.conn()?;
        let rows = Self::read_rows(
            &db,
            collection,
            &format!("WHERE {} = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT 1", index),
            [value],
        )?;
        Ok(rows.into_iter().next())
    }

    fn delete_where(&self, collection: Collection, index: &str, value: &str) -> Result<usize> {
        collection.validate_index(index)?;
        let db = self.conn()?;
        let deleted = db.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", collection.table(), index),
            [value],
        )?;
        Ok(deleted)
    }

    fn delete_older_than(&self, collection: Collection, cutoff: i64) -> Result<usize> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let deleted = tx.execute(
            &format!("DELETE FROM {} WHERE timestamp < ?1", collection.table()),
            [cutoff],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    fn clear(&self, collection: Collection) -> Result<usize> {
        let db = self.conn()?;
        let deleted = db.execute(&format!("DELETE FROM {}", collection.table()), [])?;
        Ok(deleted)
    }

    fn count(&self, collection: Collection) -> Result<usize> {
        let db = self.conn()?;
        let count: i64 = db.query_row(&format!("SELECT COUNT(*) FROM {}", collection.table()), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}
