//! Storage layer for Resumr.
//!
//! Two layers:
//! - **[`TransactionalStore`]**: row-level collections with indexes, backed
//!   by SQLite ([`SqliteStore`]) or memory ([`MemoryStore`])
//! - **[`Persistence`]**: typed queue, snapshot, and history operations
//!
//! # Example
//!
//! ```ignore
//! use resumr::store::{Persistence, SqliteStore};
//! use std::sync::Arc;
//!
//! let store = SqliteStore::open_at(Path::new("/var/lib/resumr"))?;
//! let persistence = Persistence::new(Arc::new(store));
//!
//! if let Some(snapshot) = persistence.load_latest_snapshot(now_ms())? {
//!     println!("{} tasks to resume", snapshot.live_task_count());
//! }
//! ```

mod memory;
mod persistence;
mod records;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use persistence::{
    CleanupReport, DEFAULT_HISTORY_LIMIT, DEFAULT_RETENTION, DEFAULT_SNAPSHOT_TTL, Persistence, StoreStats,
};
pub use records::{Collection, RecordRow};
pub use sqlite::{DB_FILE, SqliteStore};
pub use traits::TransactionalStore;
