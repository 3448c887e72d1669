//! In-process store.
//!
//! One mutex guards every table, so each trait method is atomic exactly as a
//! single database transaction would be. Faults can be injected to exercise
//! the engine's conflict, consistency and failure paths.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{ConflictKind, Dequeued, MoveResult, QueueCounts, QueueStore, Released};
use crate::error::{Error, Result};
use crate::model::*;

/// Store operations a [`Fault`] can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Enqueue,
    NextEnqueued,
    Acquire,
    OwnedItem,
    Release,
    Dequeue,
    AppendLog,
    ListAcquired,
    ListEnqueued,
}

/// A one-shot fault, consumed by the first matching operation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the operation at commit: nothing is written.
    Fail(StoreOp),
    /// Report the next acquire move as a lost race.
    Conflict(ConflictKind),
    /// Commit the next acquire, then re-stamp the item as owned by someone
    /// else, as a non-serializable store could.
    Steal(String),
    /// Sleep before running the operation.
    Delay(StoreOp, Duration),
}

#[derive(Default)]
struct Tables {
    items: HashMap<QueueItemId, QueueItem>,
    /// Keyed by item id: at most one marker per item per partition.
    enqueued: HashMap<QueueItemId, (u64, EnqueuedMarker)>,
    acquired: HashMap<QueueItemId, AcquiredMarker>,
    history: HashMap<QueueItemId, HistoryRecord>,
    log: Vec<LogEntry>,
    seq: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_enqueued(&mut self, marker: EnqueuedMarker) {
        let seq = self.next_seq();
        self.enqueued.insert(marker.queue_item_id, (seq, marker));
    }
}

/// Queue state held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Vec<Fault>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next matching operation.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    /// Faults not yet triggered.
    pub fn pending_faults(&self) -> usize {
        self.faults.lock().len()
    }

    /// Active partitions currently holding a marker for `id`.
    pub fn partitions(&self, id: QueueItemId) -> Vec<Partition> {
        let t = self.tables.lock();
        let mut found = Vec::new();
        if t.enqueued.contains_key(&id) {
            found.push(Partition::Enqueued);
        }
        if t.acquired.contains_key(&id) {
            found.push(Partition::Acquired);
        }
        found
    }

    fn take(&self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let pos = faults.iter().position(pred)?;
        Some(faults.remove(pos))
    }

    async fn gate(&self, op: StoreOp) -> Result<()> {
        if let Some(Fault::Delay(_, after)) =
            self.take(|f| matches!(f, Fault::Delay(o, _) if *o == op))
        {
            tokio::time::sleep(after).await;
        }
        if self.take(|f| matches!(f, Fault::Fail(o) if *o == op)).is_some() {
            return Err(Error::Store(format!("injected failure in {op:?}")));
        }
        Ok(())
    }
}

/// Counters compare types exactly.
fn counts_type(item_type: Option<&str>, candidate: &str) -> bool {
    item_type.is_none_or(|t| t == candidate)
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, item: &QueueItem, marker: &EnqueuedMarker) -> Result<()> {
        self.gate(StoreOp::Enqueue).await?;
        let mut guard = self.tables.lock();
        let t = &mut *guard;
        if t.items.contains_key(&item.id) {
            return Err(Error::Store(format!("duplicate queue item id {}", item.id)));
        }
        t.items.insert(item.id, item.clone());
        t.push_enqueued(marker.clone());
        Ok(())
    }

    async fn next_enqueued(&self, selector: &Selector) -> Result<Option<EnqueuedMarker>> {
        self.gate(StoreOp::NextEnqueued).await?;
        let t = self.tables.lock();
        let next = t
            .enqueued
            .values()
            .filter(|(_, m)| selector.admits(m.queue_item_id, &m.item_type))
            .min_by_key(|(seq, m)| (m.created, *seq))
            .map(|(_, m)| m.clone());
        Ok(next)
    }

    async fn acquire(&self, from: &EnqueuedMarker, to: &AcquiredMarker) -> Result<MoveResult<()>> {
        self.gate(StoreOp::Acquire).await?;
        if let Some(Fault::Conflict(kind)) = self.take(|f| matches!(f, Fault::Conflict(_))) {
            return Ok(Err(kind));
        }

        let mut guard = self.tables.lock();
        let t = &mut *guard;
        let id = from.queue_item_id;

        if !matches!(t.enqueued.get(&id), Some((_, m)) if m.id == from.id) {
            return Ok(Err(ConflictKind::MarkerGone));
        }
        if t.acquired.contains_key(&id) {
            return Ok(Err(ConflictKind::Duplicate));
        }
        let Some(item) = t.items.get_mut(&id) else {
            return Ok(Err(ConflictKind::MarkerGone));
        };

        item.acquired_by = Some(to.acquired_by.clone());
        item.acquired_at = Some(to.acquired_at);
        if let Some(Fault::Steal(thief)) = self.take(|f| matches!(f, Fault::Steal(_))) {
            item.acquired_by = Some(thief);
        }
        t.enqueued.remove(&id);
        t.acquired.insert(id, to.clone());
        Ok(Ok(()))
    }

    async fn owned_item(&self, id: QueueItemId, acquired_by: &str) -> Result<Option<QueueItem>> {
        self.gate(StoreOp::OwnedItem).await?;
        let t = self.tables.lock();
        Ok(t
            .items
            .get(&id)
            .filter(|item| item.acquired_by.as_deref() == Some(acquired_by))
            .cloned())
    }

    async fn discard_orphan(&self, marker: &AcquiredMarker, now: DateTime<Utc>) -> Result<bool> {
        let mut guard = self.tables.lock();
        let t = &mut *guard;
        let id = marker.queue_item_id;

        let present = matches!(t.acquired.get(&id), Some(m) if m.id == marker.id);
        if present {
            t.acquired.remove(&id);
        }

        if !t.acquired.contains_key(&id) && !t.enqueued.contains_key(&id) {
            if let Some(item) = t.items.get_mut(&id) {
                item.acquired_by = None;
                item.acquired_at = None;
                let requeued = EnqueuedMarker::new(id, item.item_type.clone(), now);
                t.push_enqueued(requeued);
            }
        }
        Ok(present)
    }

    async fn release(
        &self,
        id: QueueItemId,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Released>> {
        self.gate(StoreOp::Release).await?;
        let mut guard = self.tables.lock();
        let t = &mut *guard;

        let owned = matches!(
            t.acquired.get(&id),
            Some(m) if owner.is_none_or(|o| m.acquired_by == o)
        );
        if !owned || t.enqueued.contains_key(&id) || !t.items.contains_key(&id) {
            return Ok(None);
        }

        let (Some(from), Some(item)) = (t.acquired.remove(&id), t.items.get_mut(&id)) else {
            return Ok(None);
        };
        item.acquired_by = None;
        item.acquired_at = None;
        let item = item.clone();
        let to = from.release(now);
        t.push_enqueued(to.clone());

        Ok(Some(Released { item, from, to }))
    }

    async fn dequeue(
        &self,
        id: QueueItemId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Dequeued>> {
        self.gate(StoreOp::Dequeue).await?;
        let mut guard = self.tables.lock();
        let t = &mut *guard;

        let owned = matches!(t.acquired.get(&id), Some(m) if m.acquired_by == owner);
        if !owned || t.history.contains_key(&id) {
            return Ok(None);
        }
        let (Some(from), Some(item)) = (t.acquired.remove(&id), t.items.remove(&id)) else {
            return Ok(None);
        };

        let record = HistoryRecord::snapshot(&item, &from, now);
        t.history.insert(id, record.clone());
        Ok(Some(Dequeued { record, from }))
    }

    async fn item(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        Ok(self.tables.lock().items.get(&id).cloned())
    }

    async fn item_by_external_id(&self, external_id: &str) -> Result<Option<QueueItem>> {
        let t = self.tables.lock();
        Ok(t
            .items
            .values()
            .filter(|item| eq_ignore_case(&item.external_id, external_id))
            .min_by_key(|item| (item.created, item.id))
            .cloned())
    }

    async fn history(&self, id: QueueItemId) -> Result<Option<HistoryRecord>> {
        Ok(self.tables.lock().history.get(&id).cloned())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.gate(StoreOp::AppendLog).await?;
        self.tables.lock().log.push(entry.clone());
        Ok(())
    }

    async fn log_entries(&self, id: QueueItemId) -> Result<Vec<LogEntry>> {
        let t = self.tables.lock();
        let mut entries: Vec<LogEntry> = t
            .log
            .iter()
            .filter(|e| e.queue_item_id == id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn acquired_before(
        &self,
        filter: TypeFilter<'_>,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<QueueItemId>> {
        self.gate(StoreOp::ListAcquired).await?;
        let t = self.tables.lock();
        let mut stale: Vec<&AcquiredMarker> = t
            .acquired
            .values()
            .filter(|m| filter.matches(&m.item_type))
            .filter(|m| cutoff.is_none_or(|c| m.acquired_at <= c))
            .collect();
        stale.sort_by_key(|m| (m.acquired_at, m.queue_item_id));
        Ok(stale.into_iter().map(|m| m.queue_item_id).collect())
    }

    async fn enqueued_before(
        &self,
        filter: TypeFilter<'_>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItemId>> {
        self.gate(StoreOp::ListEnqueued).await?;
        let t = self.tables.lock();
        let mut stale: Vec<&(u64, EnqueuedMarker)> = t
            .enqueued
            .values()
            .filter(|(_, m)| filter.matches(&m.item_type) && m.created <= cutoff)
            .collect();
        stale.sort_by_key(|(seq, m)| (m.created, *seq));
        Ok(stale.into_iter().map(|(_, m)| m.queue_item_id).collect())
    }

    async fn acquired_types(&self) -> Result<Vec<String>> {
        let t = self.tables.lock();
        let mut types: Vec<String> = t.acquired.values().map(|m| m.item_type.clone()).collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn counts(&self, item_type: Option<&str>) -> Result<QueueCounts> {
        let t = self.tables.lock();
        Ok(QueueCounts {
            enqueued: t
                .enqueued
                .values()
                .filter(|(_, m)| counts_type(item_type, &m.item_type))
                .count() as u64,
            acquired: t
                .acquired
                .values()
                .filter(|m| counts_type(item_type, &m.item_type))
                .count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn enqueue_one(store: &MemoryStore, item_type: &str) -> QueueItem {
        let now = Utc::now();
        let item = NewItem::new(item_type, "ext", "data").into_record(QueueItemId::new(), now);
        let marker = EnqueuedMarker::new(item.id, item_type, now);
        store.enqueue(&item, &marker).await.unwrap();
        item
    }

    #[tokio::test]
    async fn second_acquire_of_same_marker_reports_marker_gone() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let item = NewItem::new("t", "e", "d").into_record(QueueItemId::new(), now);
        let marker = EnqueuedMarker::new(item.id, "t", now);
        store.enqueue(&item, &marker).await.unwrap();

        let first = store.acquire(&marker, &marker.acquire("a", now)).await.unwrap();
        let second = store.acquire(&marker, &marker.acquire("b", now)).await.unwrap();

        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(ConflictKind::MarkerGone));
        assert_eq!(store.partitions(item.id), vec![Partition::Acquired]);
    }

    #[tokio::test]
    async fn fifo_ties_break_by_insertion_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ids: Vec<QueueItemId> = (0..3).map(|_| QueueItemId::new()).collect();
        for id in &ids {
            let item = NewItem::new("t", "ext", "data").into_record(*id, now);
            store.enqueue(&item, &EnqueuedMarker::new(*id, "t", now)).await.unwrap();
        }

        let next = store.next_enqueued(&Selector::Any).await.unwrap().unwrap();
        assert_eq!(next.queue_item_id, ids[0]);
        let typed = store.next_enqueued(&Selector::Type("t".to_string())).await.unwrap().unwrap();
        assert_eq!(typed.queue_item_id, ids[0]);
    }

    #[tokio::test]
    async fn release_requires_matching_owner_unless_administrative() {
        let store = MemoryStore::new();
        let item = enqueue_one(&store, "t").await;
        let marker = store.next_enqueued(&Selector::Any).await.unwrap().unwrap();
        let now = Utc::now();
        store.acquire(&marker, &marker.acquire("alice", now)).await.unwrap().unwrap();

        assert!(store.release(item.id, Some("bob"), now).await.unwrap().is_none());
        let released = store.release(item.id, None, now).await.unwrap().unwrap();
        assert_eq!(released.from.acquired_by, "alice");
        assert!(!released.item.is_acquired());
        assert_eq!(store.partitions(item.id), vec![Partition::Enqueued]);
    }

    #[tokio::test]
    async fn failed_commit_writes_nothing() {
        let store = MemoryStore::new();
        store.inject(Fault::Fail(StoreOp::Enqueue));
        let now = Utc::now();
        let item = NewItem::new("t", "e", "d").into_record(QueueItemId::new(), now);
        let marker = EnqueuedMarker::new(item.id, "t", now);

        assert!(store.enqueue(&item, &marker).await.is_err());
        assert!(store.item(item.id).await.unwrap().is_none());
        assert_eq!(store.counts(None).await.unwrap(), QueueCounts::default());
        assert_eq!(store.pending_faults(), 0);
    }

    #[tokio::test]
    async fn type_selection_ignores_case_but_counts_do_not() {
        let store = MemoryStore::new();
        let item = enqueue_one(&store, "Email").await;

        let next = store
            .next_enqueued(&Selector::Type("email".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.queue_item_id, item.id);
        let listed = store
            .enqueued_before(TypeFilter::Named("EMAIL"), Utc::now())
            .await
            .unwrap();
        assert_eq!(listed, vec![item.id]);
        let found = store.item_by_external_id("EXT").await.unwrap().unwrap();
        assert_eq!(found.id, item.id);

        assert_eq!(store.counts(Some("email")).await.unwrap().total(), 0);
        assert_eq!(store.counts(Some("Email")).await.unwrap().total(), 1);
    }
}
