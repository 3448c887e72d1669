//! Queue item payload records and acquire selectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length, in characters, of an item type.
pub const ITEM_TYPE_MAX_LEN: usize = 255;
/// Maximum length, in characters, of a producer-supplied external id.
pub const EXTERNAL_ID_MAX_LEN: usize = 255;
/// Maximum length, in characters, of an acquirer identity.
pub const ACQUIRED_BY_MAX_LEN: usize = 255;

/// Newtype for queue item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(pub Uuid);

impl QueueItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for QueueItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// The durable payload of an active item, and the view handed to callers.
///
/// `acquired_by` and `acquired_at` are set exactly while an
/// [`AcquiredMarker`](super::AcquiredMarker) exists for the item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,

    /// Producer-defined category. Acquire and the admin sweep filter on it.
    pub item_type: String,

    /// Producer-defined correlation id. Not unique.
    pub external_id: String,

    /// Opaque payload. The queue never interprets it.
    pub data: String,

    /// Opaque metadata.
    pub metadata: Option<String>,

    /// Set once at enqueue. Unlike the marker timestamp, release does not reset it.
    pub created: DateTime<Utc>,

    pub acquired_by: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn is_acquired(&self) -> bool {
        self.acquired_by.is_some()
    }
}

/// Builder for enqueueing. Type and external id are truncated, never rejected.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub(crate) item_type: String,
    pub(crate) external_id: String,
    pub(crate) data: String,
    pub(crate) metadata: Option<String>,
}

impl NewItem {
    pub fn new(
        item_type: impl Into<String>,
        external_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            item_type: truncate_chars(item_type.into(), ITEM_TYPE_MAX_LEN),
            external_id: truncate_chars(external_id.into(), EXTERNAL_ID_MAX_LEN),
            data: data.into(),
            metadata: None,
        }
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn item_type(&self) -> &str {
        &self.item_type
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Materialize the record as it is stored at enqueue time.
    pub(crate) fn into_record(self, id: QueueItemId, created: DateTime<Utc>) -> QueueItem {
        QueueItem {
            id,
            item_type: self.item_type,
            external_id: self.external_id,
            data: self.data,
            metadata: self.metadata,
            created,
            acquired_by: None,
            acquired_at: None,
        }
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(mut value: String, max: usize) -> String {
    if let Some((idx, _)) = value.char_indices().nth(max) {
        value.truncate(idx);
    }
    value
}

/// Normalize an optional type filter: blank or whitespace means "any type".
pub fn type_filter(item_type: Option<&str>) -> Option<&str> {
    item_type.filter(|t| !t.trim().is_empty())
}

/// Case-insensitive comparison used for item types and external ids.
pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Which item types a stale listing covers.
///
/// Unlike the caller-facing `Option<&str>` filters, `Named("")` is a real
/// filter: it selects items whose type is blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFilter<'a> {
    Any,
    /// Items of this type, compared case-insensitively.
    Named(&'a str),
}

impl<'a> TypeFilter<'a> {
    /// Caller-facing form: missing or blank means any type.
    pub fn from_option(item_type: Option<&'a str>) -> Self {
        match type_filter(item_type) {
            Some(t) => TypeFilter::Named(t),
            None => TypeFilter::Any,
        }
    }

    pub fn name(self) -> Option<&'a str> {
        match self {
            TypeFilter::Any => None,
            TypeFilter::Named(t) => Some(t),
        }
    }

    pub fn matches(self, candidate: &str) -> bool {
        self.name().is_none_or(|t| eq_ignore_case(t, candidate))
    }
}

impl std::fmt::Display for TypeFilter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeFilter::Any => write!(f, "*"),
            TypeFilter::Named(t) => write!(f, "{t:?}"),
        }
    }
}

/// Which enqueued item an acquire (or peek) should consider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Oldest item of any type.
    Any,
    /// Oldest item of the given type, compared case-insensitively.
    Type(String),
    /// Exactly this item, if it is currently enqueued.
    Item(QueueItemId),
}

impl Selector {
    /// Build a selector from an optional type; blank types select any item.
    pub fn for_type(item_type: Option<&str>) -> Self {
        match type_filter(item_type) {
            Some(t) => Selector::Type(t.to_string()),
            None => Selector::Any,
        }
    }
}

impl Selector {
    /// Whether an enqueued marker is eligible under this selector.
    pub fn admits(&self, item_id: QueueItemId, item_type: &str) -> bool {
        match self {
            Selector::Any => true,
            Selector::Type(t) => eq_ignore_case(t, item_type),
            Selector::Item(id) => *id == item_id,
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Any => write!(f, "any"),
            Selector::Type(t) => write!(f, "type={t}"),
            Selector::Item(id) => write!(f, "item={id}"),
        }
    }
}
