//! Row and collection types shared by every store backend.
//!
//! Records are stored as JSON alongside a handful of indexed columns. Each
//! collection declares which index names it accepts; anything else is
//! rejected before it reaches SQL.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ResumrError, Result};

/// The three logical collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// Full restart snapshots (`kind = full`) and per-service status history (`kind = service`)
    ServiceSnapshots,
    /// Mirror of the live queue, rewritten on every mutation
    QueueItems,
    /// Archived terminal tasks
    History,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::ServiceSnapshots, Collection::QueueItems, Collection::History];

    /// SQL table name.
    pub fn table(&self) -> &'static str {
        match self {
            Collection::ServiceSnapshots => "service_snapshots",
            Collection::QueueItems => "queue_items",
            Collection::History => "history",
        }
    }

    /// Domain index columns (the timestamp index is implicit).
    pub fn indexes(&self) -> &'static [&'static str] {
        match self {
            Collection::ServiceSnapshots => &["service_id", "kind"],
            Collection::QueueItems => &["priority", "status"],
            Collection::History => &["status", "service_id"],
        }
    }

    /// Reject index names the collection does not declare.
    pub fn validate_index(&self, index: &str) -> Result<()> {
        if self.indexes().contains(&index) {
            Ok(())
        } else {
            Err(ResumrError::Storage(format!(
                "Collection {} has no index named {}",
                self.table(),
                index
            )))
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table())
    }
}

/// A stored record: identity, timestamp, indexed fields, JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    pub id: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub indexes: BTreeMap<String, String>,
    pub json: String,
}

impl RecordRow {
    pub fn new(id: impl Into<String>, timestamp: i64, json: String) -> Self {
        Self {
            id: id.into(),
            timestamp,
            indexes: BTreeMap::new(),
            json,
        }
    }

    pub fn with_index(mut self, name: &str, value: impl Into<String>) -> Self {
        self.indexes.insert(name.to_string(), value.into());
        self
    }

    pub fn index(&self, name: &str) -> Option<&str> {
        self.indexes.get(name).map(String::as_str)
    }

    /// Check every index on the row is declared by the collection.
    pub fn validate_for(&self, collection: Collection) -> Result<()> {
        for name in self.indexes.keys() {
            collection.validate_index(name)?;
        }
        Ok(())
    }
}
