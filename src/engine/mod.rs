//! Transition engine: the queue API producers, consumers and administrators call.
//!
//! The engine keeps no locks of its own. Every move is a single
//! [`QueueStore`] transaction, and whether a caller won a race is decided by
//! the store. The engine adds the acquire retry loop, the post-commit
//! ownership check, deadlines, the audit trail and telemetry.

pub mod admin;
mod retry;
mod transition;

pub use admin::{RequeueCount, TypeSweep};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;

use crate::audit::AuditLog;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{QueueCounts, QueueStore};
use crate::telemetry::metrics;

/// Handle to a queue. Cheap to clone; clones share the store.
pub struct Engine<S> {
    store: Arc<S>,
    audit: AuditLog<S>,
    config: QueueConfig,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            audit: self.audit.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: QueueStore> Engine<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        let config = QueueConfig {
            acquire_attempts: config.acquire_attempts.max(1),
            ..config
        };
        Self {
            audit: AuditLog::new(Arc::clone(&store), config.operation_timeout),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The item `acquire` would currently pick for `selector`, without acquiring it.
    pub async fn peek(&self, selector: &Selector) -> Result<Option<QueueItem>> {
        let selector = normalize(selector);
        self.bounded("peek", async {
            match self.store.next_enqueued(&selector).await? {
                Some(marker) => self.store.item(marker.queue_item_id).await,
                None => Ok(None),
            }
        })
        .await
    }

    /// Oldest active item carrying `external_id`.
    pub async fn peek_external_id(&self, external_id: &str) -> Result<Option<QueueItem>> {
        self.bounded("peek", self.store.item_by_external_id(external_id))
            .await
    }

    /// Active (enqueued or acquired) item by id.
    pub async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        self.bounded("get", self.store.item(id)).await
    }

    /// Terminal snapshot of a dequeued item.
    pub async fn history(&self, id: QueueItemId) -> Result<Option<HistoryRecord>> {
        self.bounded("history", self.store.history(id)).await
    }

    pub async fn audit_trail(&self, id: QueueItemId) -> Result<Vec<LogEntry>> {
        self.bounded("audit_trail", self.audit.trail(id)).await
    }

    /// Enqueued and acquired counts for one type, or for all when the type is blank.
    pub async fn counts(&self, item_type: Option<&str>) -> Result<QueueCounts> {
        self.bounded("counts", self.store.counts(type_filter(item_type)))
            .await
    }

    /// Run `work` under the operation deadline and record its duration.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let after = self.config.operation_timeout;
        let result = tokio::time::timeout(after, work)
            .await
            .unwrap_or(Err(Error::Timeout { operation, after }));
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation)],
        );
        result
    }
}

/// A `Type` selector with a blank type means any type.
fn normalize(selector: &Selector) -> Selector {
    match selector {
        Selector::Type(t) => Selector::for_type(Some(t)),
        other => other.clone(),
    }
}

fn count_transition(operation: Operation, outcome: &'static str) {
    metrics::transitions().add(
        1,
        &[
            KeyValue::new("operation", operation.as_str()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

/// Acquirer identities are required and must fit the stored column.
fn validate_acquirer(acquirer: &str) -> Result<()> {
    if acquirer.trim().is_empty() {
        return Err(Error::Precondition("acquirer id must not be blank".to_string()));
    }
    if acquirer.chars().count() > ACQUIRED_BY_MAX_LEN {
        return Err(Error::Precondition(format!(
            "acquirer id exceeds {ACQUIRED_BY_MAX_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_type_selector_normalizes_to_any() {
        assert_eq!(normalize(&Selector::Type("  ".to_string())), Selector::Any);
        assert_eq!(
            normalize(&Selector::Type("email".to_string())),
            Selector::Type("email".to_string())
        );
    }

    #[test]
    fn acquirer_must_be_present_and_bounded() {
        assert!(validate_acquirer("worker-1").is_ok());
        assert!(matches!(validate_acquirer(" "), Err(Error::Precondition(_))));
        let long = "w".repeat(ACQUIRED_BY_MAX_LEN + 1);
        assert!(matches!(validate_acquirer(&long), Err(Error::Precondition(_))));
        assert!(validate_acquirer(&"w".repeat(ACQUIRED_BY_MAX_LEN)).is_ok());
    }
}
