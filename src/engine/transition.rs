//! Enqueue, acquire, release and dequeue.

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{Instrument, Span, debug, info, warn};

use super::{Engine, count_transition, normalize, retry, validate_acquirer};
use crate::error::Result;
use crate::model::*;
use crate::store::QueueStore;
use crate::telemetry::metrics;
use crate::telemetry::queue::{
    record_acquirer, record_attempts, record_item, record_outcome, start_operation_span,
};

/// A confirmed acquisition.
struct Won {
    item: QueueItem,
    from: EnqueuedMarker,
    to: AcquiredMarker,
}

impl<S: QueueStore> Engine<S> {
    /// Add an item to the back of the queue.
    pub async fn enqueue(&self, item: NewItem) -> Result<QueueItem> {
        let span = start_operation_span("enqueue");
        async {
            let now = Utc::now();
            let record = item.into_record(QueueItemId::new(), now);
            let marker = EnqueuedMarker::new(record.id, record.item_type.clone(), now);
            record_item(&span, record.id);

            if let Err(e) = self.bounded("enqueue", self.store.enqueue(&record, &marker)).await {
                warn!(item_type = %record.item_type, error = %e, "enqueue rolled back");
                count_transition(Operation::Enqueue, "error");
                record_outcome(&span, "error");
                return Err(e);
            }

            self.audit
                .record(
                    None,
                    Some(marker.id),
                    record.id,
                    Category::success(Operation::Enqueue),
                    format!(
                        "enqueued type={} external_id={}",
                        record.item_type, record.external_id
                    ),
                )
                .await;
            count_transition(Operation::Enqueue, "success");
            record_outcome(&span, "success");
            Ok(record)
        }
        .instrument(span.clone())
        .await
    }

    /// Acquire the oldest enqueued item of any type.
    pub async fn acquire_next(&self, acquirer: &str) -> Result<Option<QueueItem>> {
        self.acquire(acquirer, &Selector::Any).await
    }

    /// Acquire the oldest enqueued item of `item_type`. A blank type matches any.
    pub async fn acquire_type(&self, acquirer: &str, item_type: &str) -> Result<Option<QueueItem>> {
        self.acquire(acquirer, &Selector::for_type(Some(item_type)))
            .await
    }

    /// Acquire one specific item, if it is currently enqueued.
    pub async fn acquire_item(&self, acquirer: &str, id: QueueItemId) -> Result<Option<QueueItem>> {
        self.acquire(acquirer, &Selector::Item(id)).await
    }

    /// Claim the oldest enqueued item matching `selector` for `acquirer`.
    ///
    /// Returns `Ok(None)` when nothing matches or every attempt lost a race.
    /// Only a blank or oversized acquirer id, a datastore failure or the
    /// operation deadline produce an error. An acquire that may have committed
    /// before failing is undone, so the item is never left held by a caller
    /// that was told it failed.
    pub async fn acquire(&self, acquirer: &str, selector: &Selector) -> Result<Option<QueueItem>> {
        let span = start_operation_span("acquire");
        async {
            record_acquirer(&span, acquirer);
            if let Err(e) = validate_acquirer(acquirer) {
                warn!(error = %e, "acquire rejected");
                count_transition(Operation::Acquire, "rejected");
                record_outcome(&span, "rejected");
                return Err(e);
            }

            let selector = normalize(selector);
            let in_flight = Mutex::new(None);
            let won = match self
                .bounded(
                    "acquire",
                    self.acquire_with_retry(&span, acquirer, &selector, &in_flight),
                )
                .await
            {
                Ok(won) => won,
                Err(e) => {
                    warn!(%selector, error = %e, "acquire failed");
                    let unconfirmed = in_flight.lock().take();
                    if let Some(marker) = unconfirmed {
                        self.abandon(&marker).await;
                    }
                    count_transition(Operation::Acquire, "error");
                    record_outcome(&span, "error");
                    return Err(e);
                }
            };

            let Some(Won { item, from, to }) = won else {
                count_transition(Operation::Acquire, "empty");
                record_outcome(&span, "empty");
                return Ok(None);
            };

            record_item(&span, item.id);
            self.audit
                .record(
                    Some(from.id),
                    Some(to.id),
                    item.id,
                    Category::success(Operation::Acquire),
                    format!("acquired by {acquirer}"),
                )
                .await;
            count_transition(Operation::Acquire, "success");
            record_outcome(&span, "success");
            Ok(Some(item))
        }
        .instrument(span.clone())
        .await
    }

    /// `in_flight` holds the acquired marker of a move that may have committed
    /// but has not yet been confirmed or cleaned up.
    async fn acquire_with_retry(
        &self,
        span: &Span,
        acquirer: &str,
        selector: &Selector,
        in_flight: &Mutex<Option<AcquiredMarker>>,
    ) -> Result<Option<Won>> {
        let attempts = self.config.acquire_attempts;
        let mut used = 0;
        let mut won = None;

        while used < attempts {
            used += 1;
            let Some(from) = self.store.next_enqueued(selector).await? else {
                break;
            };
            let to = from.acquire(acquirer, Utc::now());
            *in_flight.lock() = Some(to.clone());

            match self.store.acquire(&from, &to).await? {
                Err(kind) => {
                    *in_flight.lock() = None;
                    debug!(attempt = used, item = %from.queue_item_id, conflict = %kind, "lost acquire race");
                    metrics::conflicts().add(1, &[KeyValue::new("kind", kind.as_str())]);
                }
                Ok(()) => match self.store.owned_item(from.queue_item_id, acquirer).await? {
                    Some(item) => {
                        won = Some(Won { item, from, to });
                        break;
                    }
                    None => {
                        self.discard_orphan(&to).await?;
                        *in_flight.lock() = None;
                    }
                },
            }

            if used < attempts {
                retry::pause(self.config.retry_jitter).await;
            }
        }

        record_attempts(span, used);
        metrics::acquire_attempts().record(
            u64::from(used),
            &[KeyValue::new("outcome", if won.is_some() { "success" } else { "empty" })],
        );
        Ok(won)
    }

    /// The acquire committed, but the item is not stamped with our identity:
    /// another acquirer owns it. Drop our marker and carry on.
    async fn discard_orphan(&self, orphan: &AcquiredMarker) -> Result<()> {
        let present = self.store.discard_orphan(orphan, Utc::now()).await?;
        warn!(
            item = %orphan.queue_item_id,
            acquirer = %orphan.acquired_by,
            marker_present = present,
            "acquire committed without ownership, orphaned marker removed"
        );
        metrics::conflicts().add(1, &[KeyValue::new("kind", "orphaned")]);
        self.audit
            .record(
                Some(orphan.id),
                None,
                orphan.queue_item_id,
                Category::new(Operation::Acquire, Outcome::Orphaned),
                format!("ownership check failed for {}", orphan.acquired_by),
            )
            .await;
        Ok(())
    }

    /// Undo an acquire whose outcome the caller never received. Removes only
    /// our own marker; an item someone else holds is left alone.
    async fn abandon(&self, marker: &AcquiredMarker) {
        let discarded = self
            .bounded("acquire", self.store.discard_orphan(marker, Utc::now()))
            .await;
        match discarded {
            Ok(true) => {
                warn!(
                    item = %marker.queue_item_id,
                    acquirer = %marker.acquired_by,
                    "acquire committed after failing, item requeued"
                );
                self.audit
                    .record(
                        Some(marker.id),
                        None,
                        marker.queue_item_id,
                        Category::new(Operation::Acquire, Outcome::Abandoned),
                        format!("abandoned by {}", marker.acquired_by),
                    )
                    .await;
            }
            Ok(false) => {}
            Err(e) => warn!(
                item = %marker.queue_item_id,
                error = %e,
                "could not undo failed acquire, left for the stale sweep"
            ),
        }
    }

    /// Hand an acquired item back to the queue. It goes to the back of the line.
    ///
    /// Returns `Ok(None)` and changes nothing unless `acquirer` holds the item.
    pub async fn release(&self, acquirer: &str, id: QueueItemId) -> Result<Option<QueueItem>> {
        let span = start_operation_span("release");
        async {
            record_acquirer(&span, acquirer);
            record_item(&span, id);
            if let Err(e) = validate_acquirer(acquirer) {
                warn!(item = %id, error = %e, "release rejected");
                count_transition(Operation::Release, "rejected");
                record_outcome(&span, "rejected");
                return Err(e);
            }

            let released = self
                .bounded("release", self.store.release(id, Some(acquirer), Utc::now()))
                .await
                .inspect_err(|e| {
                    warn!(item = %id, error = %e, "release rolled back");
                    count_transition(Operation::Release, "error");
                    record_outcome(&span, "error");
                })?;

            let Some(released) = released else {
                self.reject(Operation::Release, id, acquirer).await;
                record_outcome(&span, "rejected");
                return Ok(None);
            };

            self.audit
                .record(
                    Some(released.from.id),
                    Some(released.to.id),
                    id,
                    Category::success(Operation::Release),
                    format!("released by {acquirer}"),
                )
                .await;
            count_transition(Operation::Release, "success");
            record_outcome(&span, "success");
            Ok(Some(released.item))
        }
        .instrument(span.clone())
        .await
    }

    /// Complete an acquired item: snapshot it into history and remove it.
    ///
    /// Returns `Ok(None)` and changes nothing unless `acquirer` holds the item.
    pub async fn dequeue(&self, acquirer: &str, id: QueueItemId) -> Result<Option<HistoryRecord>> {
        let span = start_operation_span("dequeue");
        async {
            record_acquirer(&span, acquirer);
            record_item(&span, id);
            if let Err(e) = validate_acquirer(acquirer) {
                warn!(item = %id, error = %e, "dequeue rejected");
                count_transition(Operation::Dequeue, "rejected");
                record_outcome(&span, "rejected");
                return Err(e);
            }

            let dequeued = self
                .bounded("dequeue", self.store.dequeue(id, acquirer, Utc::now()))
                .await
                .inspect_err(|e| {
                    warn!(item = %id, error = %e, "dequeue rolled back");
                    count_transition(Operation::Dequeue, "error");
                    record_outcome(&span, "error");
                })?;

            let Some(dequeued) = dequeued else {
                self.reject(Operation::Dequeue, id, acquirer).await;
                record_outcome(&span, "rejected");
                return Ok(None);
            };

            info!(item = %id, acquirer, "item dequeued");
            self.audit
                .record(
                    Some(dequeued.from.id),
                    None,
                    id,
                    Category::success(Operation::Dequeue),
                    format!("dequeued by {acquirer}"),
                )
                .await;
            count_transition(Operation::Dequeue, "success");
            record_outcome(&span, "success");
            Ok(Some(dequeued.record))
        }
        .instrument(span.clone())
        .await
    }

    async fn reject(&self, operation: Operation, id: QueueItemId, acquirer: &str) {
        debug!(item = %id, acquirer, operation = operation.as_str(), "not held by acquirer");
        count_transition(operation, "rejected");
        self.audit
            .record(
                None,
                None,
                id,
                Category::new(operation, Outcome::Rejected),
                format!("not held by {acquirer}"),
            )
            .await;
    }
}
