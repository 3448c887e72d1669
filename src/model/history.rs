//! Terminal snapshots of dequeued items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AcquiredMarker, QueueItem};

/// Immutable record written once, by dequeue.
///
/// `item` carries the full payload plus the ownership fields that were
/// current when the item was dequeued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub item: QueueItem,
    /// When the item was dequeued.
    pub history_created: DateTime<Utc>,
}

impl HistoryRecord {
    /// Snapshot an item at dequeue. Ownership comes from the marker, which is
    /// authoritative even if the record's own fields lag behind.
    pub fn snapshot(item: &QueueItem, marker: &AcquiredMarker, now: DateTime<Utc>) -> Self {
        let mut item = item.clone();
        item.acquired_by = Some(marker.acquired_by.clone());
        item.acquired_at = Some(marker.acquired_at);
        Self {
            item,
            history_created: now,
        }
    }
}
