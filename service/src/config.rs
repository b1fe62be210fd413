//! Configuration module for the KeyRecorder service.
//!
//! This module handles parsing configuration from environment variables.
//! Every variable is optional. A malformed value is logged and replaced by
//! its default so that a typo never keeps the recorder from starting.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `KEYRECORDER_DATABASE_PATH` | `<data dir>/keyrecorder` | Directory for the store files |
//! | `KEYRECORDER_SOCKET_PATH` | `<database path>/keyrecorder.sock` | Control channel socket |
//! | `KEYRECORDER_SYNC_INTERVAL_MINUTES` | 5 | Minutes between hot-to-main syncs |
//! | `KEYRECORDER_INTEGRITY_CHECK_INTERVAL_MINUTES` | 60 | Minutes between integrity checks |
//! | `KEYRECORDER_SNAPSHOT_INTERVAL_MINUTES` | 60 | Minutes between snapshots |
//! | `KEYRECORDER_MAX_SNAPSHOTS` | 24 | Snapshots kept after pruning |
//! | `KEYRECORDER_RETENTION_DAYS` | 7 | Age limit for stored events (0 disables) |
//! | `KEYRECORDER_MAX_EVENTS` | - | Event count limit for the main store |
//! | `KEYRECORDER_MAX_STORAGE_BYTES` | - | Reserved, not enforced |
//! | `KEYRECORDER_RECORDING_PAUSED` | false | Start with recording paused |
//! | `KEYRECORDER_DEBOUNCE_MS` | 2000 | Quiet period before buffered events are written |
//!
//! # Example
//!
//! ```no_run
//! use keyrecorder_service::config::Config;
//!
//! let config = Config::from_env();
//! println!("Database path: {}", config.database_path.display());
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use keyrecorder_core::ipc::DEFAULT_SOCKET_NAME;
use keyrecorder_core::types::RetentionPolicy;
use keyrecorder_core::utils::DEFAULT_DEBOUNCE_MS;
use tracing::warn;

pub const ENV_DATABASE_PATH: &str = "KEYRECORDER_DATABASE_PATH";
pub const ENV_SOCKET_PATH: &str = "KEYRECORDER_SOCKET_PATH";
pub const ENV_SYNC_INTERVAL: &str = "KEYRECORDER_SYNC_INTERVAL_MINUTES";
pub const ENV_INTEGRITY_CHECK_INTERVAL: &str = "KEYRECORDER_INTEGRITY_CHECK_INTERVAL_MINUTES";
pub const ENV_SNAPSHOT_INTERVAL: &str = "KEYRECORDER_SNAPSHOT_INTERVAL_MINUTES";
pub const ENV_MAX_SNAPSHOTS: &str = "KEYRECORDER_MAX_SNAPSHOTS";
pub const ENV_RETENTION_DAYS: &str = "KEYRECORDER_RETENTION_DAYS";
pub const ENV_MAX_EVENTS: &str = "KEYRECORDER_MAX_EVENTS";
pub const ENV_MAX_STORAGE_BYTES: &str = "KEYRECORDER_MAX_STORAGE_BYTES";
pub const ENV_RECORDING_PAUSED: &str = "KEYRECORDER_RECORDING_PAUSED";
pub const ENV_DEBOUNCE_MS: &str = "KEYRECORDER_DEBOUNCE_MS";

/// Data directory name under the platform data directory.
const DEFAULT_DATA_DIR: &str = "keyrecorder";

/// Default minutes between syncs.
const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 5;

/// Default minutes between integrity checks.
const DEFAULT_INTEGRITY_CHECK_INTERVAL_MINUTES: u64 = 60;

/// Default minutes between snapshots.
const DEFAULT_SNAPSHOT_INTERVAL_MINUTES: u64 = 60;

/// Default number of snapshots to keep.
const DEFAULT_MAX_SNAPSHOTS: usize = 24;

/// Configuration for the recorder service.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory holding `hot.db`, `main.db` and snapshots.
    pub database_path: PathBuf,

    /// Path of the control channel socket.
    pub socket_path: PathBuf,

    /// Interval between hot-to-main syncs.
    pub sync_interval: Duration,

    /// Interval between integrity checks. Retention runs on the same cycle.
    pub integrity_check_interval: Duration,

    /// Interval between snapshots. Snapshot pruning runs on the same cycle.
    pub snapshot_interval: Duration,

    /// Snapshots kept after each prune.
    pub max_snapshots: usize,

    pub retention: RetentionPolicy,

    /// Start with recording paused.
    pub recording_paused: bool,

    /// Quiet period before buffered events are written to the hot store.
    pub debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Reads configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_path = lookup(ENV_DATABASE_PATH)
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path);

        let socket_path = lookup(ENV_SOCKET_PATH)
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| database_path.join(DEFAULT_SOCKET_NAME));

        let minutes = |key, default| {
            Duration::from_secs(60 * parse_or(&lookup, key, default, |v: &u64| *v > 0))
        };

        Self {
            sync_interval: minutes(ENV_SYNC_INTERVAL, DEFAULT_SYNC_INTERVAL_MINUTES),
            integrity_check_interval: minutes(
                ENV_INTEGRITY_CHECK_INTERVAL,
                DEFAULT_INTEGRITY_CHECK_INTERVAL_MINUTES,
            ),
            snapshot_interval: minutes(ENV_SNAPSHOT_INTERVAL, DEFAULT_SNAPSHOT_INTERVAL_MINUTES),
            max_snapshots: parse_or(&lookup, ENV_MAX_SNAPSHOTS, DEFAULT_MAX_SNAPSHOTS, |v| {
                *v > 0
            }),
            retention: RetentionPolicy {
                retention_days: parse_or(
                    &lookup,
                    ENV_RETENTION_DAYS,
                    RetentionPolicy::default().retention_days,
                    |_| true,
                ),
                max_events: parse_optional(&lookup, ENV_MAX_EVENTS),
                max_storage_bytes: parse_optional(&lookup, ENV_MAX_STORAGE_BYTES),
            },
            recording_paused: parse_bool(&lookup, ENV_RECORDING_PAUSED, false),
            debounce: Duration::from_millis(parse_or(
                &lookup,
                ENV_DEBOUNCE_MS,
                DEFAULT_DEBOUNCE_MS,
                |_| true,
            )),
            database_path,
            socket_path,
        }
    }
}

fn default_database_path() -> PathBuf {
    match BaseDirs::new() {
        Some(dirs) => dirs.data_dir().join(DEFAULT_DATA_DIR),
        None => {
            warn!("Could not determine data directory, using working directory");
            PathBuf::from(DEFAULT_DATA_DIR)
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(key, value = %raw, "Ignoring invalid configuration value, using default");
            default
        }
    }
}

fn parse_optional<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value = %raw, "Ignoring invalid configuration value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    /// Helper to run a test with a clean KEYRECORDER_* environment.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("KEYRECORDER_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("KEYRECORDER_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[(ENV_DATABASE_PATH, "/data/kr")]);

        assert_eq!(config.database_path, PathBuf::from("/data/kr"));
        assert_eq!(config.socket_path, PathBuf::from("/data/kr/keyrecorder.sock"));
        assert_eq!(config.sync_interval, Duration::from_secs(5 * 60));
        assert_eq!(config.integrity_check_interval, Duration::from_secs(60 * 60));
        assert_eq!(config.snapshot_interval, Duration::from_secs(60 * 60));
        assert_eq!(config.max_snapshots, 24);
        assert_eq!(config.retention, RetentionPolicy::default());
        assert!(!config.recording_paused);
        assert_eq!(config.debounce, Duration::from_millis(2000));
    }

    #[test]
    fn test_default_database_path_is_named_directory() {
        let config = Config::default();
        assert!(config.database_path.ends_with(DEFAULT_DATA_DIR));
        assert!(config.socket_path.starts_with(&config.database_path));
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            (ENV_DATABASE_PATH, "/data/kr"),
            (ENV_SOCKET_PATH, "/run/kr.sock"),
            (ENV_SYNC_INTERVAL, "1"),
            (ENV_INTEGRITY_CHECK_INTERVAL, "30"),
            (ENV_SNAPSHOT_INTERVAL, "120"),
            (ENV_MAX_SNAPSHOTS, "3"),
            (ENV_RETENTION_DAYS, "0"),
            (ENV_MAX_EVENTS, "5000"),
            (ENV_MAX_STORAGE_BYTES, "1048576"),
            (ENV_RECORDING_PAUSED, "true"),
            (ENV_DEBOUNCE_MS, "250"),
        ]);

        assert_eq!(config.socket_path, PathBuf::from("/run/kr.sock"));
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.integrity_check_interval, Duration::from_secs(30 * 60));
        assert_eq!(config.snapshot_interval, Duration::from_secs(120 * 60));
        assert_eq!(config.max_snapshots, 3);
        assert_eq!(config.retention.retention_days, 0);
        assert_eq!(config.retention.max_events, Some(5000));
        assert_eq!(config.retention.max_storage_bytes, Some(1_048_576));
        assert!(config.recording_paused);
        assert_eq!(config.debounce, Duration::from_millis(250));
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let config = from_pairs(&[
            (ENV_SYNC_INTERVAL, "soon"),
            (ENV_INTEGRITY_CHECK_INTERVAL, "0"),
            (ENV_MAX_SNAPSHOTS, "-4"),
            (ENV_RETENTION_DAYS, "a week"),
            (ENV_MAX_EVENTS, "lots"),
            (ENV_RECORDING_PAUSED, "maybe"),
            (ENV_DEBOUNCE_MS, "2s"),
        ]);

        assert_eq!(config.sync_interval, Duration::from_secs(5 * 60));
        assert_eq!(config.integrity_check_interval, Duration::from_secs(60 * 60));
        assert_eq!(config.max_snapshots, 24);
        assert_eq!(config.retention.retention_days, 7);
        assert!(config.retention.max_events.is_none());
        assert!(!config.recording_paused);
        assert_eq!(config.debounce, Duration::from_millis(2000));
    }

    #[test]
    fn test_boolean_spellings() {
        for raw in ["1", "TRUE", "yes", " on "] {
            assert!(from_pairs(&[(ENV_RECORDING_PAUSED, raw)]).recording_paused);
        }
        for raw in ["0", "False", "no", "off"] {
            assert!(!from_pairs(&[(ENV_RECORDING_PAUSED, raw)]).recording_paused);
        }
    }

    #[test]
    fn test_blank_paths_use_defaults() {
        let config = from_pairs(&[(ENV_DATABASE_PATH, "/data/kr"), (ENV_SOCKET_PATH, "  ")]);
        assert_eq!(config.socket_path, PathBuf::from("/data/kr/keyrecorder.sock"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        with_clean_env(|| {
            env::set_var(ENV_DATABASE_PATH, "/tmp/keyrecorder-env-test");
            env::set_var(ENV_MAX_SNAPSHOTS, "7");

            let config = Config::from_env();

            assert_eq!(
                config.database_path,
                PathBuf::from("/tmp/keyrecorder-env-test")
            );
            assert_eq!(config.max_snapshots, 7);
        });
    }

    #[test]
    #[serial]
    fn test_from_env_with_clean_environment() {
        with_clean_env(|| {
            let config = Config::from_env();
            assert_eq!(config.max_snapshots, DEFAULT_MAX_SNAPSHOTS);
            assert!(!config.recording_paused);
        });
    }
}
