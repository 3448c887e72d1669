//! Best-effort audit trail of queue transitions.
//!
//! A failed or slow audit write is reported through `tracing` and the
//! `relq.audit.write_failures` counter, then dropped. It never changes the
//! outcome of the transition it describes.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::warn;

use crate::error::Result;
use crate::model::{Category, LogEntry, MarkerId, QueueItemId};
use crate::store::QueueStore;
use crate::telemetry::metrics;

pub struct AuditLog<S> {
    store: Arc<S>,
    write_timeout: Duration,
}

impl<S> Clone for AuditLog<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            write_timeout: self.write_timeout,
        }
    }
}

impl<S: QueueStore> AuditLog<S> {
    pub fn new(store: Arc<S>, write_timeout: Duration) -> Self {
        Self {
            store,
            write_timeout,
        }
    }

    /// Append one entry. Never fails.
    pub async fn record(
        &self,
        source: Option<MarkerId>,
        destination: Option<MarkerId>,
        queue_item_id: QueueItemId,
        category: Category,
        text: impl Into<String>,
    ) {
        let entry = LogEntry::new(source, destination, queue_item_id, category, text);
        self.append(&entry).await;
    }

    async fn append(&self, entry: &LogEntry) {
        let failure = match tokio::time::timeout(self.write_timeout, self.store.append_log(entry)).await
        {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.write_timeout),
        };

        warn!(
            item = %entry.queue_item_id,
            category = %entry.category,
            error = %failure,
            "audit log write failed, entry dropped"
        );
        metrics::audit_write_failures().add(
            1,
            &[KeyValue::new("category", entry.category.to_string())],
        );
    }

    /// Entries for one item, oldest first.
    pub async fn trail(&self, queue_item_id: QueueItemId) -> Result<Vec<LogEntry>> {
        self.store.log_entries(queue_item_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operation;
    use crate::store::{Fault, MemoryStore, StoreOp};

    #[tokio::test]
    async fn write_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditLog::new(Arc::clone(&store), Duration::from_secs(1));
        let id = QueueItemId::new();

        store.inject(Fault::Fail(StoreOp::AppendLog));
        audit
            .record(None, None, id, Category::success(Operation::Enqueue), "lost")
            .await;
        audit
            .record(None, None, id, Category::success(Operation::Enqueue), "kept")
            .await;

        let trail = audit.trail(id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].text, "kept");
    }

    #[tokio::test]
    async fn slow_write_is_abandoned() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditLog::new(Arc::clone(&store), Duration::from_millis(20));
        store.inject(Fault::Delay(StoreOp::AppendLog, Duration::from_secs(5)));

        let id = QueueItemId::new();
        audit
            .record(None, None, id, Category::success(Operation::Dequeue), "slow")
            .await;

        assert!(audit.trail(id).await.unwrap().is_empty());
    }
}
