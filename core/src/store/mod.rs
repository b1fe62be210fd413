//! SQLite-backed store tiers for event records.
//!
//! Every tier is a single SQLite file in write-ahead-log mode holding one
//! `key_events` table. The [`Store`] trait carries the operations shared by
//! the hot and main tiers; each tier adds its own on top:
//!
//! - [`HotStore`]: low-latency ingest, tracks which records still need to be
//!   migrated to the main tier.
//! - [`MainStore`]: long-lived, queryable, prunable, integrity-checked.
//! - [`SnapshotStore`]: whole-file copies of the main tier used for recovery.
//!
//! All store methods are blocking. Async callers run them on
//! `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row, Statement};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{EventRecord, KeyAction, Modifiers, TimeRange};

pub mod hot;
pub mod main;
pub mod snapshot;

pub use hot::HotStore;
pub use main::MainStore;
pub use snapshot::SnapshotStore;

/// File name of the hot tier inside the base directory.
pub const HOT_DB_FILE: &str = "hot.db";

/// File name of the main tier inside the base directory.
pub const MAIN_DB_FILE: &str = "main.db";

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS key_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sequence_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    virtual_key_code INTEGER NOT NULL,
    key_name TEXT NOT NULL,
    is_key_down INTEGER NOT NULL,
    is_shift INTEGER NOT NULL,
    is_ctrl INTEGER NOT NULL,
    is_alt INTEGER NOT NULL,
    is_win INTEGER NOT NULL,
    window_title TEXT,
    process_name TEXT,
    is_synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_key_events_timestamp ON key_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_key_events_sequence ON key_events(sequence_id);
CREATE INDEX IF NOT EXISTS idx_key_events_synced ON key_events(is_synced);
"#;

pub(crate) const SELECT_COLUMNS: &str = "id, sequence_id, timestamp, virtual_key_code, key_name, \
     is_key_down, is_shift, is_ctrl, is_alt, is_win, window_title, process_name, is_synced";

const INSERT_SQL: &str = "INSERT INTO key_events \
     (sequence_id, timestamp, virtual_key_code, key_name, is_key_down, \
      is_shift, is_ctrl, is_alt, is_win, window_title, process_name, is_synced) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store file or its directory could not be created or opened.
    #[error("failed to initialize store at {}: {reason}", .path.display())]
    Init { path: PathBuf, reason: String },

    /// An operation was attempted before [`Store::initialize`].
    #[error("store at {} is not initialized", .path.display())]
    NotInitialized { path: PathBuf },

    /// A multi-row write was rolled back; none of its rows are visible.
    #[error("transaction rolled back: {0}")]
    Transaction(#[source] rusqlite::Error),

    /// A snapshot with the same name already exists.
    #[error("snapshot {name} already exists")]
    SnapshotExists { name: String },

    /// Single-statement database error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A lazily opened SQLite connection bound to one file.
///
/// The connection is `None` until [`initialize`](Self::initialize) and after
/// [`close`](Self::close); every query goes through
/// [`with_connection`](Self::with_connection), which reports
/// [`StoreError::NotInitialized`] in that case.
pub struct Database {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl Database {
    /// Creates a handle for the database file at `path` without opening it.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
        }
    }

    /// Path of the underlying database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if a connection is currently open.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Opens the database, enabling WAL journaling and creating the schema.
    ///
    /// Calling this on an open database only re-applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Init`] if the directory or file cannot be
    /// created, or the file is not a usable SQLite database.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock();

        if let Some(conn) = guard.as_ref() {
            conn.execute_batch(SCHEMA_SQL)
                .map_err(|e| self.init_error(e))?;
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.init_error(e))?;
        }

        let conn = Connection::open(&self.path).map_err(|e| self.init_error(e))?;

        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| self.init_error(e))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(path = %self.path.display(), mode = %mode, "WAL journaling unavailable");
        }

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| self.init_error(e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| self.init_error(e))?;

        debug!(path = %self.path.display(), "Database opened");
        *guard = Some(conn);
        Ok(())
    }

    /// Closes the connection. Subsequent operations fail until re-initialized.
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                warn!(path = %self.path.display(), error = %e, "Error closing database");
            }
            debug!(path = %self.path.display(), "Database closed");
        }
    }

    /// Opens a second, short-lived connection to the same file.
    ///
    /// The new connection shares no page cache with the long-lived one, so
    /// it sees what is actually on disk. It never creates the file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] if the database is not open.
    pub fn open_detached(&self) -> Result<Connection, StoreError> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized {
                path: self.path.clone(),
            });
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Runs `f` against the open connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] if the database is not open,
    /// otherwise whatever `f` returns.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or_else(|| StoreError::NotInitialized {
            path: self.path.clone(),
        })?;
        f(conn)
    }

    fn init_error(&self, err: impl std::fmt::Display) -> StoreError {
        StoreError::Init {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}

/// Operations shared by the hot and main tiers.
pub trait Store {
    /// The database backing this tier.
    fn database(&self) -> &Database;

    /// Path of the tier's database file.
    fn path(&self) -> &Path {
        self.database().path()
    }

    /// See [`Database::initialize`].
    fn initialize(&self) -> Result<(), StoreError> {
        self.database().initialize()
    }

    /// See [`Database::close`].
    fn close(&self) {
        self.database().close();
    }

    /// Inserts one record and returns its storage id.
    fn insert(&self, record: &EventRecord) -> Result<i64, StoreError> {
        self.database().with_connection(|conn| {
            let mut stmt = conn.prepare_cached(INSERT_SQL)?;
            execute_insert(&mut stmt, record)?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Inserts all records in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transaction`] if any row fails; the whole batch
    /// is rolled back and the caller should retry.
    fn bulk_insert(&self, records: &[EventRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        self.database().with_connection(|conn| {
            let tx = conn.transaction().map_err(StoreError::Transaction)?;
            {
                let mut stmt = tx
                    .prepare_cached(INSERT_SQL)
                    .map_err(StoreError::Transaction)?;
                for record in records {
                    execute_insert(&mut stmt, record).map_err(StoreError::Transaction)?;
                }
            }
            tx.commit().map_err(StoreError::Transaction)
        })
    }

    /// Returns up to `limit` records inside `range`, newest first.
    fn query(&self, range: TimeRange, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        self.database().with_connection(|conn| {
            let mut clauses = Vec::new();
            let mut values = Vec::new();

            if let Some(start) = range.start {
                clauses.push("timestamp >= ?");
                values.push(Value::Text(format_timestamp(start)));
            }
            if let Some(end) = range.end {
                clauses.push("timestamp <= ?");
                values.push(Value::Text(format_timestamp(end)));
            }
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM key_events {where_clause} \
                 ORDER BY timestamp DESC, sequence_id DESC LIMIT ?"
            );

            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params_from_iter(values.iter()), record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Number of records in this tier.
    fn count(&self) -> Result<u64, StoreError> {
        self.database().with_connection(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM key_events", [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
    }

    /// Largest stored sequence id, or zero for an empty tier.
    fn max_sequence_id(&self) -> Result<i64, StoreError> {
        self.database().with_connection(|conn| {
            let max = conn.query_row(
                "SELECT COALESCE(MAX(sequence_id), 0) FROM key_events",
                [],
                |row| row.get(0),
            )?;
            Ok(max)
        })
    }
}

fn execute_insert(stmt: &mut Statement<'_>, record: &EventRecord) -> rusqlite::Result<usize> {
    let modifiers = &record.action.modifiers;
    stmt.execute(params![
        record.sequence_id,
        format_timestamp(record.timestamp),
        record.action.virtual_key_code,
        record.action.key_name,
        record.action.is_key_down,
        modifiers.shift,
        modifiers.ctrl,
        modifiers.alt,
        modifiers.win,
        record.window_title,
        record.process_name,
        record.synced,
    ])
}

/// Maps a row selected with [`SELECT_COLUMNS`] to a record.
pub(crate) fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let raw_timestamp: String = row.get(2)?;
    let timestamp = parse_timestamp(&raw_timestamp)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(EventRecord {
        id: row.get(0)?,
        sequence_id: row.get(1)?,
        timestamp,
        action: KeyAction {
            virtual_key_code: row.get(3)?,
            key_name: row.get(4)?,
            is_key_down: row.get(5)?,
            modifiers: Modifiers {
                shift: row.get(6)?,
                ctrl: row.get(7)?,
                alt: row.get(8)?,
                win: row.get(9)?,
            },
        },
        window_title: row.get(10)?,
        process_name: row.get(11)?,
        synced: row.get(12)?,
    })
}

/// Formats a timestamp with fixed nanosecond width so that lexical order in
/// SQLite matches chronological order.
pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
