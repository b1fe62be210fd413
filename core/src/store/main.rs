//! Main tier: long-term storage with pruning and integrity checks.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::{debug, warn};

use super::{format_timestamp, Database, Store, StoreError, MAIN_DB_FILE};

/// Long-lived store that receives migrated records from the hot tier.
pub struct MainStore {
    db: Database,
}

impl MainStore {
    /// Creates a main store at `<base_dir>/main.db`.
    #[must_use]
    pub fn new(base_dir: &Path) -> Self {
        Self {
            db: Database::new(base_dir.join(MAIN_DB_FILE)),
        }
    }

    /// Runs SQLite's integrity check against the file on disk.
    ///
    /// The check uses its own connection, so damage done to the file after
    /// it was opened is seen rather than masked by the page cache. A file
    /// whose header is no longer SQLite's fails without running the pragma.
    ///
    /// Returns `Ok(false)` when the database reports any problem.
    pub fn integrity_check(&self) -> Result<bool, StoreError> {
        let conn = self.db.open_detached()?;
        let path = self.db.path();

        if !has_sqlite_header(path)? {
            warn!(path = %path.display(), "Database file header is damaged");
            return Ok(false);
        }

        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if result != "ok" {
            debug!(path = %path.display(), result = %result, "Integrity check reported problems");
        }
        Ok(result == "ok")
    }

    /// Deletes all records captured before `cutoff`. Returns the deleted count.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_connection(|conn| {
            let tx = conn.transaction().map_err(StoreError::Transaction)?;
            let deleted = tx
                .execute(
                    "DELETE FROM key_events WHERE timestamp < ?1",
                    params![format_timestamp(cutoff)],
                )
                .map_err(StoreError::Transaction)?;
            tx.commit().map_err(StoreError::Transaction)?;
            Ok(deleted)
        })
    }

    /// Keeps only the `keep` newest records. Returns the deleted count.
    pub fn prune_excess(&self, keep: u64) -> Result<usize, StoreError> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        self.db.with_connection(|conn| {
            let tx = conn.transaction().map_err(StoreError::Transaction)?;
            let deleted = tx
                .execute(
                    "DELETE FROM key_events WHERE id NOT IN ( \
                         SELECT id FROM key_events \
                         ORDER BY timestamp DESC, sequence_id DESC LIMIT ?1)",
                    params![keep],
                )
                .map_err(StoreError::Transaction)?;
            tx.commit().map_err(StoreError::Transaction)?;
            Ok(deleted)
        })
    }

    /// Folds the write-ahead log into the database file so that a plain file
    /// copy captures every committed record.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        self.db.with_connection(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

/// Magic string at the start of every SQLite database file.
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

fn has_sqlite_header(path: &Path) -> Result<bool, StoreError> {
    let mut header = [0u8; 16];
    match File::open(path)?.read_exact(&mut header) {
        Ok(()) => Ok(&header == SQLITE_HEADER),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl Store for MainStore {
    fn database(&self) -> &Database {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{base_time, record};
    use super::*;
    use crate::types::TimeRange;
    use chrono::Duration;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> MainStore {
        let store = MainStore::new(dir.path());
        store.initialize().unwrap();
        store
    }

    #[test]
    fn test_integrity_check_passes_on_fresh_store() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.insert(&record(1, 0)).unwrap();

        assert!(store.integrity_check().unwrap());
    }

    #[test]
    fn test_integrity_check_sees_damage_after_open() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let records: Vec<_> = (1..=20).map(|i| record(i, i)).collect();
        store.bulk_insert(&records).unwrap();
        store.checkpoint().unwrap();
        assert!(store.integrity_check().unwrap());

        std::fs::write(store.path(), vec![0xA5; 16 * 1024]).unwrap();

        assert!(!store.integrity_check().unwrap());
    }

    #[test]
    fn test_integrity_check_on_closed_store_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.close();

        assert!(matches!(
            store.integrity_check(),
            Err(StoreError::NotInitialized { .. })
        ));
    }

    #[test]
    fn test_prune_older_than_drops_old_records() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let records: Vec<_> = (0..5).map(|i| record(i + 1, i * 3600)).collect();
        store.bulk_insert(&records).unwrap();

        let deleted = store
            .prune_older_than(base_time() + Duration::hours(2))
            .unwrap();

        assert_eq!(deleted, 2);
        let remaining = store.query(TimeRange::all(), 10).unwrap();
        let sequence: Vec<_> = remaining.iter().map(|r| r.sequence_id).collect();
        assert_eq!(sequence, vec![5, 4, 3]);
    }

    #[test]
    fn test_prune_excess_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let records: Vec<_> = (1..=10).map(|i| record(i, i)).collect();
        store.bulk_insert(&records).unwrap();

        let deleted = store.prune_excess(4).unwrap();

        assert_eq!(deleted, 6);
        let remaining = store.query(TimeRange::all(), 10).unwrap();
        let sequence: Vec<_> = remaining.iter().map(|r| r.sequence_id).collect();
        assert_eq!(sequence, vec![10, 9, 8, 7]);
    }

    #[test]
    fn test_prune_excess_below_count_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.bulk_insert(&[record(1, 0), record(2, 1)]).unwrap();

        assert_eq!(store.prune_excess(10).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_checkpoint_leaves_data_readable() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.insert(&record(1, 0)).unwrap();

        store.checkpoint().unwrap();

        assert_eq!(store.count().unwrap(), 1);
    }
}
