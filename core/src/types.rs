//! Event types for KeyRecorder persistence.
//!
//! This module defines the records that flow from a capture source through
//! the debounce buffer and into the store tiers. All types serialize to
//! camelCase JSON, which is also the payload format used on the control
//! channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Modifier keys held while an action was captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifiers {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub win: bool,
}

/// The captured action: which key, which direction, which modifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAction {
    /// Platform virtual key code.
    pub virtual_key_code: u32,

    /// Display name for the key, resolved by the capture source.
    pub key_name: String,

    /// `true` for key-down, `false` for key-up.
    pub is_key_down: bool,

    #[serde(default)]
    pub modifiers: Modifiers,
}

/// An event as produced by a capture source, before it has been sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedEvent {
    /// Capture time.
    pub timestamp: DateTime<Utc>,

    pub action: KeyAction,

    /// Title of the foreground window, if the capture source could resolve it.
    #[serde(default)]
    pub window_title: Option<String>,

    /// Name of the foreground process, if the capture source could resolve it.
    #[serde(default)]
    pub process_name: Option<String>,
}

impl CapturedEvent {
    /// Creates a captured event stamped with the current time and no attribution.
    #[must_use]
    pub fn now(action: KeyAction) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            window_title: None,
            process_name: None,
        }
    }

    /// Converts this event into an unsynced record carrying `sequence_id`.
    ///
    /// The storage id is left at zero; each tier assigns its own.
    #[must_use]
    pub fn into_record(self, sequence_id: i64) -> EventRecord {
        EventRecord {
            id: 0,
            sequence_id,
            timestamp: self.timestamp,
            action: self.action,
            window_title: self.window_title,
            process_name: self.process_name,
            synced: false,
        }
    }
}

/// A persisted event.
///
/// `id` is assigned by whichever store the record was read from and is not
/// stable across tiers. `sequence_id` is the ordering and deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: i64,
    pub sequence_id: i64,
    pub timestamp: DateTime<Utc>,
    pub action: KeyAction,
    pub window_title: Option<String>,
    pub process_name: Option<String>,
    pub synced: bool,
}

/// Optional inclusive bounds for store queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// A range with no bounds, selecting the most recent records.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A range bounded on both ends.
    #[must_use]
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

/// Retention configuration applied on every maintenance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Age threshold in days. Zero disables age-based pruning.
    pub retention_days: u32,

    /// Keep at most this many events in the main store.
    pub max_events: Option<u64>,

    /// Reserved: size budget for the store directory. Not enforced.
    pub max_storage_bytes: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 7,
            max_events: None,
            max_storage_bytes: None,
        }
    }
}
