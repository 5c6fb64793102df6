//! The storage contract every backend implements.

use crate::error::Result;
use crate::store::records::{Collection, RecordRow};

/// Collection-based store with transactional writes.
///
/// Each method touches exactly one collection and is all-or-nothing within
/// it. Consistency across collections is the caller's concern.
pub trait TransactionalStore: Send + Sync {
    /// Replace the entire contents of a collection with `rows`, preserving order.
    fn replace_all(&self, collection: Collection, rows: &[RecordRow]) -> Result<()>;

    /// Delete every row whose `index` equals `value`, then insert `row`.
    fn replace_where(&self, collection: Collection, index: &str, value: &str, row: &RecordRow) -> Result<()>;

    /// Insert rows (replacing any with the same id).
    fn append_many(&self, collection: Collection, rows: &[RecordRow]) -> Result<()>;

    /// Insert a single row.
    fn append(&self, collection: Collection, row: &RecordRow) -> Result<()> {
        self.append_many(collection, std::slice::from_ref(row))
    }

    /// All rows in insertion order.
    fn list(&self, collection: Collection) -> Result<Vec<RecordRow>>;

    /// Rows whose `index` equals `value`, in insertion order.
    fn query_by_index(&self, collection: Collection, index: &str, value: &str) -> Result<Vec<RecordRow>>;

    /// Newest row (by timestamp) whose `index` equals `value`.
    fn latest_where(&self, collection: Collection, index: &str, value: &str) -> Result<Option<RecordRow>>;

    /// Delete rows whose `index` equals `value`; returns the count.
    fn delete_where(&self, collection: Collection, index: &str, value: &str) -> Result<usize>;

    /// Delete every row with `timestamp < cutoff`; returns the count.
    fn delete_older_than(&self, collection: Collection, cutoff: i64) -> Result<usize>;

    /// Delete everything in the collection; returns the count.
    fn clear(&self, collection: Collection) -> Result<usize>;

    fn count(&self, collection: Collection) -> Result<usize>;
}
