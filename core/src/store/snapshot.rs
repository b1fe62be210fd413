//! Point-in-time copies of the main tier.
//!
//! Snapshots are plain file copies named `snapshot_YYYYMMDD_HHMMSS.db` and
//! live next to the tier files. Names sort lexically in creation order, so
//! the newest snapshot is always the last name in sorted order.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::StoreError;

const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_SUFFIX: &str = ".db";
const SNAPSHOT_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Suffix appended to a database file moved aside during restore.
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// Directory of main-tier snapshots.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies `source` into a new snapshot stamped with the current time.
    ///
    /// The source must be quiescent or checkpointed; see
    /// [`MainStore::checkpoint`](super::MainStore::checkpoint).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SnapshotExists`] if a snapshot was already taken
    /// within the same second, or [`StoreError::Io`] if the copy fails.
    pub fn create(&self, source: &Path) -> Result<String, StoreError> {
        self.create_at(source, Utc::now())
    }

    /// Like [`create`](Self::create) with an explicit timestamp.
    pub fn create_at(&self, source: &Path, at: DateTime<Utc>) -> Result<String, StoreError> {
        let name = snapshot_name(at);
        let path = self.dir.join(&name);

        fs::create_dir_all(&self.dir)?;
        let mut target = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StoreError::SnapshotExists { name: name.clone() },
                _ => StoreError::Io(e),
            })?;

        let copied = File::open(source)
            .and_then(|mut src| io::copy(&mut src, &mut target))
            .and_then(|bytes| target.sync_all().map(|()| bytes));

        match copied {
            Ok(bytes) => {
                debug!(snapshot = %name, bytes, "Snapshot written");
                Ok(name)
            }
            Err(e) => {
                drop(target);
                if let Err(cleanup) = fs::remove_file(&path) {
                    warn!(snapshot = %name, error = %cleanup, "Failed to remove partial snapshot");
                }
                Err(StoreError::Io(e))
            }
        }
    }

    /// Snapshot names, newest first. A missing directory yields an empty list.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_snapshot_name(&name) && entry.file_type()?.is_file() {
                names.push(name);
            }
        }

        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Deletes all but the `max_keep` newest snapshots.
    ///
    /// Individual deletion failures are logged and skipped. Returns the
    /// number of snapshots actually deleted.
    pub fn prune(&self, max_keep: usize) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for name in self.list()?.into_iter().skip(max_keep) {
            match fs::remove_file(self.dir.join(&name)) {
                Ok(()) => {
                    debug!(snapshot = %name, "Deleted old snapshot");
                    deleted += 1;
                }
                Err(e) => warn!(snapshot = %name, error = %e, "Failed to delete old snapshot"),
            }
        }
        Ok(deleted)
    }

    /// Replaces `target` with the named snapshot.
    ///
    /// The existing target is moved to `<target>.corrupt` first, replacing
    /// any earlier aside file. Stale `-wal`/`-shm` files are removed only
    /// after the copy succeeds. Returns `false` and leaves `target` in place
    /// if anything fails. The caller must close any connection on `target`
    /// beforehand.
    pub fn restore(&self, snapshot: &str, target: &Path) -> bool {
        let source = self.dir.join(snapshot);
        if !is_snapshot_name(snapshot) || !source.is_file() {
            warn!(snapshot = %snapshot, "Snapshot not found");
            return false;
        }

        let aside = with_suffix(target, CORRUPT_SUFFIX);
        let moved_aside = if target.exists() {
            if let Err(e) = fs::rename(target, &aside) {
                warn!(target = %target.display(), error = %e, "Failed to move database aside");
                return false;
            }
            true
        } else {
            false
        };

        if let Err(e) = fs::copy(&source, target) {
            warn!(snapshot = %snapshot, error = %e, "Failed to copy snapshot into place");
            if moved_aside {
                if let Err(e) = fs::rename(&aside, target) {
                    warn!(target = %target.display(), error = %e, "Failed to move database back");
                }
            }
            return false;
        }

        for side in ["-wal", "-shm"] {
            let side_file = with_suffix(target, side);
            match fs::remove_file(&side_file) {
                Ok(()) => debug!(file = %side_file.display(), "Removed stale journal file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(
                    file = %side_file.display(),
                    error = %e,
                    "Failed to remove stale journal file"
                ),
            }
        }

        info!(snapshot = %snapshot, target = %target.display(), "Snapshot restored");
        true
    }
}

fn snapshot_name(at: DateTime<Utc>) -> String {
    format!(
        "{SNAPSHOT_PREFIX}{}{SNAPSHOT_SUFFIX}",
        at.format(SNAPSHOT_TIME_FORMAT)
    )
}

fn is_snapshot_name(name: &str) -> bool {
    name.strip_prefix(SNAPSHOT_PREFIX)
        .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
        .is_some_and(|stamp| stamp.len() == 15 && !stamp.contains(['/', '\\']))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}
