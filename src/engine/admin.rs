//! Administrative sweep: find and reclaim acquisitions whose owner never came back.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{Instrument, info, warn};

use super::{Engine, count_transition};
use crate::config::StaleTimeouts;
use crate::error::Result;
use crate::model::*;
use crate::store::QueueStore;
use crate::telemetry::queue::{record_outcome, start_operation_span};

/// Result of one stale requeue pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequeueCount {
    pub succeeded: i64,
    pub total: i64,
}

impl RequeueCount {
    /// The listing query failed, so no item was attempted.
    pub const NOT_RUN: Self = Self {
        succeeded: -1,
        total: -1,
    };

    pub fn ran(&self) -> bool {
        self.total >= 0
    }

    /// Every listed item was requeued.
    pub fn is_complete(&self) -> bool {
        self.ran() && self.succeeded == self.total
    }
}

/// One line of a [`Engine::sweep`] report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeSweep {
    pub item_type: String,
    pub threshold_secs: i64,
    pub count: RequeueCount,
}

/// `now - threshold`, or no cutoff at all for a non-positive threshold.
fn acquired_cutoff(now: DateTime<Utc>, threshold: TimeDelta) -> Option<DateTime<Utc>> {
    if threshold <= TimeDelta::zero() {
        return None;
    }
    Some(now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC))
}

impl<S: QueueStore> Engine<S> {
    /// Acquired items held at least `threshold`. A zero or negative threshold lists all of them.
    pub async fn list_stale_acquired(
        &self,
        item_type: Option<&str>,
        threshold: TimeDelta,
    ) -> Result<Vec<QueueItemId>> {
        self.stale_acquired(TypeFilter::from_option(item_type), threshold)
            .await
    }

    async fn stale_acquired(
        &self,
        filter: TypeFilter<'_>,
        threshold: TimeDelta,
    ) -> Result<Vec<QueueItemId>> {
        let cutoff = acquired_cutoff(Utc::now(), threshold);
        self.bounded(
            "list_stale_acquired",
            self.store.acquired_before(filter, cutoff),
        )
        .await
    }

    /// Enqueued items that have waited at least `max_age`. The sign of `max_age` is ignored.
    pub async fn list_stale_enqueued(
        &self,
        item_type: Option<&str>,
        max_age: TimeDelta,
    ) -> Result<Vec<QueueItemId>> {
        let now = Utc::now();
        let cutoff = now
            .checked_sub_signed(max_age.abs())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.bounded(
            "list_stale_enqueued",
            self.store
                .enqueued_before(TypeFilter::from_option(item_type), cutoff),
        )
        .await
    }

    /// Force-release every item acquired longer than `threshold`, whoever holds it.
    ///
    /// One item failing does not stop the rest. Returns
    /// [`RequeueCount::NOT_RUN`] if the stale items could not be listed.
    pub async fn requeue_stale(&self, item_type: Option<&str>, threshold: TimeDelta) -> RequeueCount {
        self.requeue_matching(TypeFilter::from_option(item_type), threshold)
            .await
    }

    async fn requeue_matching(&self, filter: TypeFilter<'_>, threshold: TimeDelta) -> RequeueCount {
        let span = start_operation_span("requeue_stale");
        async {
            let stale = match self.stale_acquired(filter, threshold).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(item_type = %filter, error = %e, "stale listing failed, sweep skipped");
                    record_outcome(&span, "error");
                    return RequeueCount::NOT_RUN;
                }
            };

            let mut count = RequeueCount {
                succeeded: 0,
                total: 0,
            };
            for id in stale {
                count.total += 1;
                if self.requeue_one(id).await {
                    count.succeeded += 1;
                }
            }

            if count.total > 0 {
                info!(
                    item_type = %filter,
                    succeeded = count.succeeded,
                    total = count.total,
                    "stale acquisitions requeued"
                );
            }
            record_outcome(&span, if count.is_complete() { "success" } else { "partial" });
            count
        }
        .instrument(span.clone())
        .await
    }

    async fn requeue_one(&self, id: QueueItemId) -> bool {
        let released = self
            .bounded("requeue", self.store.release(id, None, Utc::now()))
            .await;
        match released {
            Ok(Some(released)) => {
                self.audit
                    .record(
                        Some(released.from.id),
                        Some(released.to.id),
                        id,
                        Category::success(Operation::Requeue),
                        format!(
                            "requeued stale item acquired by {} at {}",
                            released.from.acquired_by,
                            released.from.acquired_at.to_rfc3339()
                        ),
                    )
                    .await;
                count_transition(Operation::Requeue, "success");
                true
            }
            Ok(None) => {
                // Released or dequeued by its owner since it was listed.
                count_transition(Operation::Requeue, "rejected");
                false
            }
            Err(e) => {
                warn!(item = %id, error = %e, "stale requeue failed");
                count_transition(Operation::Requeue, "error");
                false
            }
        }
    }

    /// Requeue stale items type by type using a timeout table.
    ///
    /// Types listed in the table use their own threshold; every other type
    /// currently holding acquired items, including the blank type, uses the
    /// table's default. Types differing only in case are swept once.
    pub async fn sweep(&self, table: &StaleTimeouts) -> Vec<TypeSweep> {
        let mut report = Vec::new();
        for (item_type, threshold) in table.listed() {
            report.push(TypeSweep {
                item_type: item_type.to_string(),
                threshold_secs: threshold.num_seconds(),
                count: self
                    .requeue_matching(TypeFilter::Named(item_type), threshold)
                    .await,
            });
        }

        let remaining = match self.bounded("sweep", self.store.acquired_types()).await {
            Ok(types) => types,
            Err(e) => {
                warn!(error = %e, "listing acquired types failed, default sweep skipped");
                report.push(TypeSweep {
                    item_type: "*".to_string(),
                    threshold_secs: table.default_threshold().num_seconds(),
                    count: RequeueCount::NOT_RUN,
                });
                return report;
            }
        };

        let default = table.default_threshold();
        let mut swept: HashSet<String> = HashSet::new();
        for item_type in remaining {
            if table.lists(&item_type) || !swept.insert(item_type.to_lowercase()) {
                continue;
            }
            let count = self
                .requeue_matching(TypeFilter::Named(&item_type), default)
                .await;
            report.push(TypeSweep {
                item_type,
                threshold_secs: default.num_seconds(),
                count,
            });
        }
        report
    }
}
