//! Merging of hot-tier and main-tier query results.

use std::collections::HashSet;

use crate::types::EventRecord;

#[derive(Debug, PartialEq, Eq, Hash)]
enum MergeKey {
    Sequence(i64),
    Ticks(i64),
}

/// Records written before sequencing existed carry a zero sequence id and
/// fall back to their capture time.
fn merge_key(record: &EventRecord) -> MergeKey {
    if record.sequence_id != 0 {
        MergeKey::Sequence(record.sequence_id)
    } else {
        MergeKey::Ticks(
            record
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_else(|| record.timestamp.timestamp_micros()),
        )
    }
}

/// Combines both tiers into one newest-first list of at most `limit` records.
///
/// A record present in both tiers (migrated but not yet purged from hot)
/// appears once; the hot copy wins.
#[must_use]
pub fn merge_recent(
    hot: Vec<EventRecord>,
    main: Vec<EventRecord>,
    limit: usize,
) -> Vec<EventRecord> {
    let mut seen = HashSet::with_capacity(hot.len() + main.len());
    let mut merged: Vec<EventRecord> = hot
        .into_iter()
        .chain(main)
        .filter(|record| seen.insert(merge_key(record)))
        .collect();

    merged.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.sequence_id.cmp(&a.sequence_id))
    });
    merged.truncate(limit);
    merged
}
