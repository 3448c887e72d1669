//! State markers: the Enqueued and Acquired partitions.
//!
//! Markers are plain records related to their item only by `queue_item_id`.
//! A marker is never mutated; every transition deletes one and inserts the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::QueueItemId;

/// Newtype for marker IDs (both partitions share the id space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(pub Uuid);

impl MarkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MarkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MarkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which active partition an item currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Enqueued,
    Acquired,
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::Enqueued => write!(f, "enqueued"),
            Partition::Acquired => write!(f, "acquired"),
        }
    }
}

/// An item waiting to be acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueuedMarker {
    pub id: MarkerId,
    pub queue_item_id: QueueItemId,
    pub item_type: String,
    /// FIFO key. Reset to "now" on every (re-)enqueue.
    pub created: DateTime<Utc>,
}

impl EnqueuedMarker {
    pub fn new(queue_item_id: QueueItemId, item_type: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            id: MarkerId::new(),
            queue_item_id,
            item_type: item_type.into(),
            created,
        }
    }

    /// The marker that replaces this one when `acquired_by` takes the item.
    pub fn acquire(&self, acquired_by: impl Into<String>, acquired_at: DateTime<Utc>) -> AcquiredMarker {
        AcquiredMarker {
            id: MarkerId::new(),
            queue_item_id: self.queue_item_id,
            item_type: self.item_type.clone(),
            created: self.created,
            acquired_by: acquired_by.into(),
            acquired_at,
        }
    }
}

/// An item held by one acquirer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquiredMarker {
    pub id: MarkerId,
    pub queue_item_id: QueueItemId,
    pub item_type: String,
    /// Copied from the enqueued marker this one replaced (enqueue time, not acquire time).
    pub created: DateTime<Utc>,
    pub acquired_by: String,
    pub acquired_at: DateTime<Utc>,
}

impl AcquiredMarker {
    /// The marker that replaces this one on release: same item, back of the queue.
    pub fn release(&self, now: DateTime<Utc>) -> EnqueuedMarker {
        EnqueuedMarker::new(self.queue_item_id, self.item_type.clone(), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn acquire_keeps_enqueue_time() {
        let enqueued_at = Utc::now() - TimeDelta::minutes(5);
        let marker = EnqueuedMarker::new(QueueItemId::new(), "email", enqueued_at);
        let acquired = marker.acquire("worker-1", Utc::now());

        assert_eq!(acquired.queue_item_id, marker.queue_item_id);
        assert_eq!(acquired.created, enqueued_at);
        assert_ne!(acquired.id, marker.id);
    }

    #[test]
    fn release_resets_fifo_key() {
        let marker = EnqueuedMarker::new(QueueItemId::new(), "email", Utc::now() - TimeDelta::hours(1));
        let acquired = marker.acquire("worker-1", Utc::now());
        let now = Utc::now();
        let requeued = acquired.release(now);

        assert_eq!(requeued.created, now);
        assert_eq!(requeued.item_type, "email");
        assert_ne!(requeued.id, marker.id);
    }
}
