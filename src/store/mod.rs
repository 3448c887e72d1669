//! Datastore seam for the transition engine.
//!
//! Each [`QueueStore`] method is one atomic unit of work against the shared
//! store: either a pure read or a single transaction that commits entirely or
//! not at all. The engine holds no locks of its own; whether it won a race is
//! decided here, by the store's conflict detection.

pub mod memory;

pub use memory::{Fault, MemoryStore, StoreOp};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::*;

/// Why an atomic move did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The source marker was already consumed by someone else.
    MarkerGone,
    /// The destination partition already holds a marker for this item.
    Duplicate,
    /// Any other store-signalled conflict (e.g. a serialization failure).
    Other,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::MarkerGone => "marker_gone",
            ConflictKind::Duplicate => "duplicate",
            ConflictKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an atomic move: done, or a soft conflict the caller may retry.
pub type MoveResult<T> = std::result::Result<T, ConflictKind>;

/// Result of a committed release (owner or administrative).
#[derive(Debug, Clone)]
pub struct Released {
    /// The item record after release (ownership cleared).
    pub item: QueueItem,
    pub from: AcquiredMarker,
    pub to: EnqueuedMarker,
}

/// Result of a committed dequeue.
#[derive(Debug, Clone)]
pub struct Dequeued {
    pub record: HistoryRecord,
    pub from: AcquiredMarker,
}

/// Active-item counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub enqueued: u64,
    pub acquired: u64,
}

impl QueueCounts {
    /// Active items: enqueued plus acquired.
    pub fn total(&self) -> u64 {
        self.enqueued + self.acquired
    }
}

/// Storage backend for queue state.
///
/// Item types match case-insensitively in selectors and stale listings.
/// Counters take an already normalized filter (`None` is every type) and
/// match it exactly.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert an item record and its enqueued marker together.
    async fn enqueue(&self, item: &QueueItem, marker: &EnqueuedMarker) -> Result<()>;

    /// Oldest enqueued marker matching `selector`: ascending `created`, ties
    /// broken by insertion order.
    async fn next_enqueued(&self, selector: &Selector) -> Result<Option<EnqueuedMarker>>;

    /// Atomically delete `from`, insert `to`, and stamp the item record with
    /// `to`'s ownership fields.
    async fn acquire(&self, from: &EnqueuedMarker, to: &AcquiredMarker) -> Result<MoveResult<()>>;

    /// The item record, only if it is currently stamped as owned by `acquired_by`.
    async fn owned_item(&self, id: QueueItemId, acquired_by: &str) -> Result<Option<QueueItem>>;

    /// Remove an acquired marker that lost a post-commit ownership check.
    ///
    /// If no acquired marker remains for the item afterwards, the item is put
    /// back in the enqueued partition so it cannot be stranded. Returns
    /// whether the marker was still present.
    async fn discard_orphan(&self, marker: &AcquiredMarker, now: DateTime<Utc>) -> Result<bool>;

    /// Move an acquired item back to enqueued with `created = now`.
    ///
    /// With `owner = Some(..)` the acquired marker must name exactly that
    /// acquirer; `None` releases regardless of owner (administrative).
    /// Returns `None`, without side effects, if the precondition fails.
    async fn release(
        &self,
        id: QueueItemId,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Released>>;

    /// Move an item owned by `owner` to history and delete its record.
    async fn dequeue(&self, id: QueueItemId, owner: &str, now: DateTime<Utc>)
    -> Result<Option<Dequeued>>;

    /// Active item record by id.
    async fn item(&self, id: QueueItemId) -> Result<Option<QueueItem>>;

    /// Oldest active item with the given external id, compared case-insensitively.
    async fn item_by_external_id(&self, external_id: &str) -> Result<Option<QueueItem>>;

    async fn history(&self, id: QueueItemId) -> Result<Option<HistoryRecord>>;

    /// Append one audit entry in its own short transaction.
    async fn append_log(&self, entry: &LogEntry) -> Result<()>;

    /// Audit entries for an item, oldest first.
    async fn log_entries(&self, id: QueueItemId) -> Result<Vec<LogEntry>>;

    /// Acquired items, optionally only those acquired at or before `cutoff`.
    async fn acquired_before(
        &self,
        filter: TypeFilter<'_>,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<QueueItemId>>;

    /// Enqueued items whose marker was created at or before `cutoff`.
    async fn enqueued_before(
        &self,
        filter: TypeFilter<'_>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItemId>>;

    /// Distinct item types currently in the acquired partition.
    async fn acquired_types(&self) -> Result<Vec<String>>;

    async fn counts(&self, item_type: Option<&str>) -> Result<QueueCounts>;
}
