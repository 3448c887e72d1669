//! Audit log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MarkerId, QueueItemId};

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    /// Marker consumed by the transition. `None` for enqueue.
    pub source: Option<MarkerId>,
    /// Marker produced by the transition. `None` for dequeue and rejections.
    pub destination: Option<MarkerId>,
    pub queue_item_id: QueueItemId,
    pub category: Category,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        source: Option<MarkerId>,
        destination: Option<MarkerId>,
        queue_item_id: QueueItemId,
        category: Category,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination,
            queue_item_id,
            category,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Enqueue,
    Acquire,
    Release,
    Dequeue,
    /// Administrative release of a stale acquisition.
    Requeue,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Enqueue => "Enqueue",
            Operation::Acquire => "Acquire",
            Operation::Release => "Release",
            Operation::Dequeue => "Dequeue",
            Operation::Requeue => "Requeue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Ownership precondition failed; nothing changed.
    Rejected,
    /// A post-commit check found another acquirer owns the item; our marker was removed.
    Orphaned,
    /// The acquire hit its deadline after committing; our marker was removed.
    Abandoned,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "Success",
            Outcome::Rejected => "Rejected",
            Outcome::Orphaned => "Orphaned",
            Outcome::Abandoned => "Abandoned",
        }
    }
}

/// Operation plus outcome, rendered as `Operation.Outcome` (e.g. `Acquire.Success`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category {
    pub operation: Operation,
    pub outcome: Outcome,
}

impl Category {
    pub const fn new(operation: Operation, outcome: Outcome) -> Self {
        Self { operation, outcome }
    }

    pub const fn success(operation: Operation) -> Self {
        Self::new(operation, Outcome::Success)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.operation.as_str(), self.outcome.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (op, outcome) = s
            .split_once('.')
            .ok_or_else(|| format!("malformed category: {s}"))?;
        let operation = match op {
            "Enqueue" => Operation::Enqueue,
            "Acquire" => Operation::Acquire,
            "Release" => Operation::Release,
            "Dequeue" => Operation::Dequeue,
            "Requeue" => Operation::Requeue,
            _ => return Err(format!("unknown operation: {op}")),
        };
        let outcome = match outcome {
            "Success" => Outcome::Success,
            "Rejected" => Outcome::Rejected,
            "Orphaned" => Outcome::Orphaned,
            "Abandoned" => Outcome::Abandoned,
            _ => return Err(format!("unknown outcome: {outcome}")),
        };
        Ok(Category { operation, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_renders_operation_dot_outcome() {
        assert_eq!(Category::success(Operation::Enqueue).to_string(), "Enqueue.Success");
        assert_eq!(
            Category::new(Operation::Acquire, Outcome::Orphaned).to_string(),
            "Acquire.Orphaned"
        );
    }

    #[test]
    fn category_parses_what_it_renders() {
        let cat = Category::new(Operation::Release, Outcome::Rejected);
        assert_eq!(cat.to_string().parse::<Category>(), Ok(cat));
        assert!("Release".parse::<Category>().is_err());
        assert!("Launch.Success".parse::<Category>().is_err());
    }
}
