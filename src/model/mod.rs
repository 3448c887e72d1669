//! Core data model.
//!
//! An item's payload lives in one [`QueueItem`] record. Its position in the
//! queue is tracked by at most one lightweight marker: an [`EnqueuedMarker`]
//! while it waits, an [`AcquiredMarker`] while a consumer holds it. Dequeued
//! items leave a [`HistoryRecord`]; every transition leaves a [`LogEntry`].

pub mod audit;
pub mod history;
pub mod item;
pub mod marker;

pub use audit::{Category, LogEntry, Operation, Outcome};
pub use history::HistoryRecord;
pub use item::{
    ACQUIRED_BY_MAX_LEN, EXTERNAL_ID_MAX_LEN, ITEM_TYPE_MAX_LEN, NewItem, QueueItem, QueueItemId,
    Selector, TypeFilter, eq_ignore_case, truncate_chars, type_filter,
};
pub use marker::{AcquiredMarker, EnqueuedMarker, MarkerId, Partition};
