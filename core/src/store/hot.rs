//! Hot tier: the first durable landing place for debounced batches.

use std::path::Path;

use rusqlite::params;

use super::{record_from_row, Database, Store, StoreError, HOT_DB_FILE, SELECT_COLUMNS};
use crate::types::EventRecord;

/// Low-latency store that holds records until they are migrated to main.
pub struct HotStore {
    db: Database,
}

impl HotStore {
    /// Creates a hot store at `<base_dir>/hot.db`.
    #[must_use]
    pub fn new(base_dir: &Path) -> Self {
        Self {
            db: Database::new(base_dir.join(HOT_DB_FILE)),
        }
    }

    /// All records not yet migrated, in ascending sequence order.
    pub fn unsynced(&self) -> Result<Vec<EventRecord>, StoreError> {
        self.db.with_connection(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM key_events \
                 WHERE is_synced = 0 ORDER BY sequence_id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Flags the records with the given storage ids as synced.
    ///
    /// Returns the number of rows updated. Unknown ids are ignored.
    pub fn mark_synced(&self, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.db.with_connection(|conn| {
            let tx = conn.transaction().map_err(StoreError::Transaction)?;
            let mut updated = 0;
            {
                let mut stmt = tx
                    .prepare_cached("UPDATE key_events SET is_synced = 1 WHERE id = ?1")
                    .map_err(StoreError::Transaction)?;
                for id in ids {
                    updated += stmt.execute(params![id]).map_err(StoreError::Transaction)?;
                }
            }
            tx.commit().map_err(StoreError::Transaction)?;
            Ok(updated)
        })
    }

    /// Deletes every synced record and returns how many were removed.
    pub fn purge_synced(&self) -> Result<usize, StoreError> {
        self.db.with_connection(|conn| {
            let purged = conn.execute("DELETE FROM key_events WHERE is_synced = 1", [])?;
            Ok(purged)
        })
    }
}

impl Store for HotStore {
    fn database(&self) -> &Database {
        &self.db
    }
}
