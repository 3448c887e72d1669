//! Atomic state transitions in Postgres.
//!
//! Every move deletes its source marker and inserts its destination marker in
//! one transaction. A source marker that is already gone means another
//! process won; unique and serialization violations are reported the same
//! way, as soft conflicts. Anything else is a hard error and the transaction
//! is dropped, which rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{Db, conflict_kind};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{ConflictKind, Dequeued, MoveResult, QueueCounts, QueueStore, Released};

type SqlResult<T> = std::result::Result<T, sqlx::Error>;

const ITEM_COLUMNS: &str =
    "id, item_type, external_id, data, metadata, created_at, acquired_by, acquired_at";
const ACQUIRED_COLUMNS: &str =
    "id, queue_item_id, item_type, created_at, acquired_by, acquired_at";

impl Db {
    async fn enqueue_tx(&self, item: &QueueItem, marker: &EnqueuedMarker) -> SqlResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO queue_items (id, item_type, external_id, data, metadata, created_at, acquired_by, acquired_at)
             VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL)",
        )
        .bind(item.id.0)
        .bind(&item.item_type)
        .bind(&item.external_id)
        .bind(&item.data)
        .bind(&item.metadata)
        .bind(item.created)
        .execute(&mut *tx)
        .await?;

        insert_enqueued(&mut tx, marker).await?;

        tx.commit().await
    }

    async fn acquire_tx(
        &self,
        from: &EnqueuedMarker,
        to: &AcquiredMarker,
    ) -> SqlResult<MoveResult<()>> {
        let mut tx = self.pool().begin().await?;

        // Row lock on the marker: a concurrent acquirer blocks here, then sees zero rows.
        let deleted = sqlx::query("DELETE FROM enqueued_markers WHERE id = $1")
            .bind(from.id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await?;
            return Ok(Err(ConflictKind::MarkerGone));
        }

        sqlx::query(
            "INSERT INTO acquired_markers (id, queue_item_id, item_type, created_at, acquired_by, acquired_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(to.id.0)
        .bind(to.queue_item_id.0)
        .bind(&to.item_type)
        .bind(to.created)
        .bind(&to.acquired_by)
        .bind(to.acquired_at)
        .execute(&mut *tx)
        .await?;

        let stamped = sqlx::query(
            "UPDATE queue_items SET acquired_by = $1, acquired_at = $2 WHERE id = $3",
        )
        .bind(&to.acquired_by)
        .bind(to.acquired_at)
        .bind(to.queue_item_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if stamped == 0 {
            tx.rollback().await?;
            return Ok(Err(ConflictKind::MarkerGone));
        }

        tx.commit().await?;
        Ok(Ok(()))
    }

    async fn discard_orphan_tx(&self, marker: &AcquiredMarker, now: DateTime<Utc>) -> SqlResult<bool> {
        let mut tx = self.pool().begin().await?;

        let item_type: Option<(String,)> =
            sqlx::query_as("SELECT item_type FROM queue_items WHERE id = $1 FOR UPDATE")
                .bind(marker.queue_item_id.0)
                .fetch_optional(&mut *tx)
                .await?;

        let present = sqlx::query("DELETE FROM acquired_markers WHERE id = $1")
            .bind(marker.id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        let (active,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM acquired_markers WHERE queue_item_id = $1)
                 OR EXISTS (SELECT 1 FROM enqueued_markers WHERE queue_item_id = $1)",
        )
        .bind(marker.queue_item_id.0)
        .fetch_one(&mut *tx)
        .await?;

        if let (false, Some((item_type,))) = (active, item_type) {
            sqlx::query("UPDATE queue_items SET acquired_by = NULL, acquired_at = NULL WHERE id = $1")
                .bind(marker.queue_item_id.0)
                .execute(&mut *tx)
                .await?;
            let requeued = EnqueuedMarker::new(marker.queue_item_id, item_type, now);
            insert_enqueued(&mut tx, &requeued).await?;
        }

        tx.commit().await?;
        Ok(present)
    }

    async fn release_tx(
        &self,
        id: QueueItemId,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> SqlResult<Option<Released>> {
        let mut tx = self.pool().begin().await?;

        let from: Option<AcquiredRow> = sqlx::query_as(&format!(
            "DELETE FROM acquired_markers
             WHERE queue_item_id = $1 AND ($2::varchar IS NULL OR acquired_by = $2)
             RETURNING {ACQUIRED_COLUMNS}"
        ))
        .bind(id.0)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(from) = from.map(AcquiredMarker::from) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let to = from.release(now);
        insert_enqueued(&mut tx, &to).await?;

        let item: Option<ItemRow> = sqlx::query_as(&format!(
            "UPDATE queue_items SET acquired_by = NULL, acquired_at = NULL
             WHERE id = $1
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(item) = item.map(QueueItem::from) else {
            tx.rollback().await?;
            return Ok(None);
        };

        tx.commit().await?;
        Ok(Some(Released { item, from, to }))
    }

    async fn dequeue_tx(
        &self,
        id: QueueItemId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> SqlResult<Option<Dequeued>> {
        let mut tx = self.pool().begin().await?;

        let from: Option<AcquiredRow> = sqlx::query_as(&format!(
            "DELETE FROM acquired_markers
             WHERE queue_item_id = $1 AND acquired_by = $2
             RETURNING {ACQUIRED_COLUMNS}"
        ))
        .bind(id.0)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(from) = from.map(AcquiredMarker::from) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let item: Option<ItemRow> = sqlx::query_as(&format!(
            "DELETE FROM queue_items WHERE id = $1 RETURNING {ITEM_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(item) = item.map(QueueItem::from) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let record = HistoryRecord::snapshot(&item, &from, now);
        sqlx::query(
            "INSERT INTO queue_history (id, item_type, external_id, data, metadata, created_at, acquired_by, acquired_at, history_created)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(record.item.id.0)
        .bind(&record.item.item_type)
        .bind(&record.item.external_id)
        .bind(&record.item.data)
        .bind(&record.item.metadata)
        .bind(record.item.created)
        .bind(&record.item.acquired_by)
        .bind(record.item.acquired_at)
        .bind(record.history_created)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(Dequeued { record, from }))
    }

    async fn append_log_tx(&self, entry: &LogEntry) -> SqlResult<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO queue_log (id, source_marker_id, destination_marker_id, queue_item_id, category, text, logged_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id)
        .bind(entry.source.map(|m| m.0))
        .bind(entry.destination.map(|m| m.0))
        .bind(entry.queue_item_id.0)
        .bind(entry.category.to_string())
        .bind(&entry.text)
        .bind(entry.timestamp)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }
}

async fn insert_enqueued(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    marker: &EnqueuedMarker,
) -> SqlResult<()> {
    sqlx::query(
        "INSERT INTO enqueued_markers (id, queue_item_id, item_type, created_at)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(marker.id.0)
    .bind(marker.queue_item_id.0)
    .bind(&marker.item_type)
    .bind(marker.created)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Soft conflicts on moves that have no retry loop collapse to "nothing moved".
fn conflict_as_none<T>(operation: &str, id: QueueItemId, result: SqlResult<Option<T>>) -> Result<Option<T>> {
    match result {
        Ok(moved) => Ok(moved),
        Err(e) => match conflict_kind(&e) {
            Some(kind) => {
                debug!(operation, item = %id, conflict = %kind, "move rolled back on conflict");
                Ok(None)
            }
            None => Err(e.into()),
        },
    }
}

#[async_trait]
impl QueueStore for Db {
    async fn enqueue(&self, item: &QueueItem, marker: &EnqueuedMarker) -> Result<()> {
        Ok(self.enqueue_tx(item, marker).await?)
    }

    async fn next_enqueued(&self, selector: &Selector) -> Result<Option<EnqueuedMarker>> {
        const SELECT: &str = "SELECT id, queue_item_id, item_type, created_at FROM enqueued_markers";
        let row: Option<EnqueuedRow> = match selector {
            Selector::Any => {
                sqlx::query_as(&format!("{SELECT} ORDER BY created_at, seq LIMIT 1"))
                    .fetch_optional(self.pool())
                    .await?
            }
            Selector::Type(item_type) => {
                sqlx::query_as(&format!(
                    "{SELECT} WHERE lower(item_type) = lower($1) ORDER BY created_at, seq LIMIT 1"
                ))
                .bind(item_type)
                .fetch_optional(self.pool())
                .await?
            }
            Selector::Item(id) => {
                sqlx::query_as(&format!("{SELECT} WHERE queue_item_id = $1"))
                    .bind(id.0)
                    .fetch_optional(self.pool())
                    .await?
            }
        };
        Ok(row.map(EnqueuedMarker::from))
    }

    async fn acquire(&self, from: &EnqueuedMarker, to: &AcquiredMarker) -> Result<MoveResult<()>> {
        match self.acquire_tx(from, to).await {
            Ok(moved) => Ok(moved),
            Err(e) => match conflict_kind(&e) {
                Some(kind) => Ok(Err(kind)),
                None => Err(e.into()),
            },
        }
    }

    async fn owned_item(&self, id: QueueItemId, acquired_by: &str) -> Result<Option<QueueItem>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = $1 AND acquired_by = $2"
        ))
        .bind(id.0)
        .bind(acquired_by)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(QueueItem::from))
    }

    async fn discard_orphan(&self, marker: &AcquiredMarker, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.discard_orphan_tx(marker, now).await?)
    }

    async fn release(
        &self,
        id: QueueItemId,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Released>> {
        conflict_as_none("release", id, self.release_tx(id, owner, now).await)
    }

    async fn dequeue(
        &self,
        id: QueueItemId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Dequeued>> {
        conflict_as_none("dequeue", id, self.dequeue_tx(id, owner, now).await)
    }

    async fn item(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        let row: Option<ItemRow> =
            sqlx::query_as(&format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(QueueItem::from))
    }

    async fn item_by_external_id(&self, external_id: &str) -> Result<Option<QueueItem>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items
             WHERE lower(external_id) = lower($1)
             ORDER BY created_at, id
             LIMIT 1"
        ))
        .bind(external_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(QueueItem::from))
    }

    async fn history(&self, id: QueueItemId) -> Result<Option<HistoryRecord>> {
        let row: Option<HistoryRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS}, history_created FROM queue_history WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(HistoryRecord::from))
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        Ok(self.append_log_tx(entry).await?)
    }

    async fn log_entries(&self, id: QueueItemId) -> Result<Vec<LogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT id, source_marker_id, destination_marker_id, queue_item_id, category, text, logged_at
             FROM queue_log
             WHERE queue_item_id = $1
             ORDER BY logged_at ASC",
        )
        .bind(id.0)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(LogRow::try_into_entry).collect()
    }

    async fn acquired_before(
        &self,
        filter: TypeFilter<'_>,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<QueueItemId>> {
        self.list_acquired(filter, cutoff).await
    }

    async fn enqueued_before(
        &self,
        filter: TypeFilter<'_>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItemId>> {
        self.list_enqueued(filter, cutoff).await
    }

    async fn acquired_types(&self) -> Result<Vec<String>> {
        self.list_acquired_types().await
    }

    async fn counts(&self, item_type: Option<&str>) -> Result<QueueCounts> {
        self.count_active(item_type).await
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
pub(super) struct ItemRow {
    id: Uuid,
    item_type: String,
    external_id: String,
    data: String,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
    acquired_by: Option<String>,
    acquired_at: Option<DateTime<Utc>>,
}

impl From<ItemRow> for QueueItem {
    fn from(row: ItemRow) -> Self {
        QueueItem {
            id: QueueItemId(row.id),
            item_type: row.item_type,
            external_id: row.external_id,
            data: row.data,
            metadata: row.metadata,
            created: row.created_at,
            acquired_by: row.acquired_by,
            acquired_at: row.acquired_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EnqueuedRow {
    id: Uuid,
    queue_item_id: Uuid,
    item_type: String,
    created_at: DateTime<Utc>,
}

impl From<EnqueuedRow> for EnqueuedMarker {
    fn from(row: EnqueuedRow) -> Self {
        EnqueuedMarker {
            id: MarkerId(row.id),
            queue_item_id: QueueItemId(row.queue_item_id),
            item_type: row.item_type,
            created: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AcquiredRow {
    id: Uuid,
    queue_item_id: Uuid,
    item_type: String,
    created_at: DateTime<Utc>,
    acquired_by: String,
    acquired_at: DateTime<Utc>,
}

impl From<AcquiredRow> for AcquiredMarker {
    fn from(row: AcquiredRow) -> Self {
        AcquiredMarker {
            id: MarkerId(row.id),
            queue_item_id: QueueItemId(row.queue_item_id),
            item_type: row.item_type,
            created: row.created_at,
            acquired_by: row.acquired_by,
            acquired_at: row.acquired_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    #[sqlx(flatten)]
    item: ItemRow,
    history_created: DateTime<Utc>,
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        HistoryRecord {
            item: row.item.into(),
            history_created: row.history_created,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    source_marker_id: Option<Uuid>,
    destination_marker_id: Option<Uuid>,
    queue_item_id: Uuid,
    category: String,
    text: String,
    logged_at: DateTime<Utc>,
}

impl LogRow {
    fn try_into_entry(self) -> Result<LogEntry> {
        Ok(LogEntry {
            id: self.id,
            source: self.source_marker_id.map(MarkerId),
            destination: self.destination_marker_id.map(MarkerId),
            queue_item_id: QueueItemId(self.queue_item_id),
            category: self.category.parse().map_err(Error::Other)?,
            text: self.text,
            timestamp: self.logged_at,
        })
    }
}
