//! Read-only listings and counters for administrative sweeps.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{QueueItemId, TypeFilter};
use crate::store::QueueCounts;

impl super::Db {
    /// Acquired items matching `filter`, acquired at or before `cutoff`.
    pub async fn list_acquired(
        &self,
        filter: TypeFilter<'_>,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<QueueItemId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT queue_item_id FROM acquired_markers
             WHERE ($1::varchar IS NULL OR lower(item_type) = lower($1))
               AND ($2::timestamptz IS NULL OR acquired_at <= $2)
             ORDER BY acquired_at ASC",
        )
        .bind(filter.name())
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| QueueItemId(id)).collect())
    }

    /// Enqueued items whose marker is at least as old as `cutoff`, oldest first.
    pub async fn list_enqueued(
        &self,
        filter: TypeFilter<'_>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItemId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT queue_item_id FROM enqueued_markers
             WHERE ($1::varchar IS NULL OR lower(item_type) = lower($1))
               AND created_at <= $2
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(filter.name())
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| QueueItemId(id)).collect())
    }

    pub async fn list_acquired_types(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT item_type FROM acquired_markers ORDER BY item_type")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Enqueued and acquired marker counts, optionally for one exactly matching type.
    pub async fn count_active(&self, item_type: Option<&str>) -> Result<QueueCounts> {
        let (enqueued, acquired): (i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM enqueued_markers WHERE $1::varchar IS NULL OR item_type = $1),
                (SELECT COUNT(*) FROM acquired_markers WHERE $1::varchar IS NULL OR item_type = $1)",
        )
        .bind(item_type)
        .fetch_one(self.pool())
        .await?;
        Ok(QueueCounts {
            enqueued: enqueued.max(0) as u64,
            acquired: acquired.max(0) as u64,
        })
    }
}
