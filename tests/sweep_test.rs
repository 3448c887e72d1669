//! Administrative sweep: stale listings and forced requeue.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use relq::config::{QueueConfig, StaleTimeouts};
use relq::engine::{Engine, RequeueCount};
use relq::model::*;
use relq::store::{Fault, MemoryStore, StoreOp};

fn test_engine() -> Engine<MemoryStore> {
    Engine::new(
        Arc::new(MemoryStore::new()),
        QueueConfig {
            acquire_attempts: 10,
            retry_jitter: Duration::ZERO,
            operation_timeout: Duration::from_secs(5),
        },
    )
}

async fn acquired(engine: &Engine<MemoryStore>, item_type: &str, acquirer: &str) -> QueueItem {
    let item = engine
        .enqueue(NewItem::new(item_type, "ext", "data"))
        .await
        .unwrap();
    engine.acquire_item(acquirer, item.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn non_positive_threshold_lists_every_acquired_item() {
    let engine = test_engine();
    let a = acquired(&engine, "email", "w1").await;
    let b = acquired(&engine, "report", "w2").await;
    engine.enqueue(NewItem::new("email", "idle", "d")).await.unwrap();

    let mut all = engine
        .list_stale_acquired(None, TimeDelta::zero())
        .await
        .unwrap();
    all.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(all, expected);

    let email = engine
        .list_stale_acquired(Some("email"), TimeDelta::seconds(-1))
        .await
        .unwrap();
    assert_eq!(email, vec![a.id]);
}

#[tokio::test]
async fn requeue_respects_threshold() {
    let engine = test_engine();
    let item = acquired(&engine, "email", "crashed-worker").await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    let untouched = engine
        .requeue_stale(Some("email"), TimeDelta::hours(1))
        .await;
    assert_eq!(untouched, RequeueCount { succeeded: 0, total: 0 });
    assert_eq!(engine.store().partitions(item.id), vec![Partition::Acquired]);

    let requeued = engine
        .requeue_stale(Some("email"), TimeDelta::milliseconds(20))
        .await;
    assert_eq!(requeued, RequeueCount { succeeded: 1, total: 1 });
    assert!(requeued.is_complete());
    assert_eq!(engine.store().partitions(item.id), vec![Partition::Enqueued]);

    let again = engine.acquire_next("new-worker").await.unwrap().unwrap();
    assert_eq!(again.id, item.id);
    assert_eq!(again.acquired_by.as_deref(), Some("new-worker"));
}

#[tokio::test]
async fn requeue_is_audited_with_previous_owner() {
    let engine = test_engine();
    let item = acquired(&engine, "email", "crashed-worker").await;

    engine.requeue_stale(None, TimeDelta::zero()).await;

    let trail = engine.audit_trail(item.id).await.unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.category.to_string(), "Requeue.Success");
    assert!(last.text.contains("crashed-worker"));
    assert_eq!(last.source, trail[1].destination);
}

#[tokio::test]
async fn listing_failure_returns_sentinel() {
    let engine = test_engine();
    let item = acquired(&engine, "email", "w").await;
    engine.store().inject(Fault::Fail(StoreOp::ListAcquired));

    let count = engine.requeue_stale(None, TimeDelta::zero()).await;

    assert_eq!(count, RequeueCount::NOT_RUN);
    assert_eq!((count.succeeded, count.total), (-1, -1));
    assert_eq!(engine.store().partitions(item.id), vec![Partition::Acquired]);
}

#[tokio::test]
async fn one_failed_item_does_not_stop_the_sweep() {
    let engine = test_engine();
    acquired(&engine, "email", "w1").await;
    acquired(&engine, "email", "w2").await;
    engine.store().inject(Fault::Fail(StoreOp::Release));

    let count = engine.requeue_stale(None, TimeDelta::zero()).await;

    assert_eq!(count, RequeueCount { succeeded: 1, total: 2 });
    assert!(!count.is_complete());
    let counts = engine.counts(None).await.unwrap();
    assert_eq!((counts.enqueued, counts.acquired), (1, 1));
}

#[tokio::test]
async fn stale_enqueued_uses_magnitude_of_max_age() {
    let engine = test_engine();
    let waiting = engine
        .enqueue(NewItem::new("email", "starved", "d"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let negative = engine
        .list_stale_enqueued(Some("email"), TimeDelta::milliseconds(-10))
        .await
        .unwrap();
    assert_eq!(negative, vec![waiting.id]);

    let positive = engine
        .list_stale_enqueued(None, TimeDelta::milliseconds(10))
        .await
        .unwrap();
    assert_eq!(positive, vec![waiting.id]);

    assert!(engine
        .list_stale_enqueued(None, TimeDelta::hours(1))
        .await
        .unwrap()
        .is_empty());
    assert!(engine
        .list_stale_enqueued(Some("report"), TimeDelta::zero())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(engine.store().partitions(waiting.id), vec![Partition::Enqueued]);
}

#[tokio::test]
async fn sweep_applies_per_type_thresholds() {
    let engine = test_engine();
    let email = acquired(&engine, "email", "w1").await;
    let report = acquired(&engine, "report", "w2").await;
    let index = acquired(&engine, "index", "w3").await;

    let table = StaleTimeouts {
        default_secs: 3600,
        ..StaleTimeouts::default()
    }
    .with_type("email", 0);

    let report_lines = engine.sweep(&table).await;

    let summary: Vec<(String, i64, i64)> = report_lines
        .iter()
        .map(|l| (l.item_type.clone(), l.count.succeeded, l.count.total))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("email".to_string(), 1, 1),
            ("index".to_string(), 0, 0),
            ("report".to_string(), 0, 0),
        ]
    );
    assert_eq!(engine.store().partitions(email.id), vec![Partition::Enqueued]);
    assert_eq!(engine.store().partitions(report.id), vec![Partition::Acquired]);
    assert_eq!(engine.store().partitions(index.id), vec![Partition::Acquired]);
}

#[tokio::test]
async fn sweep_reclaims_blank_typed_items_with_default_threshold() {
    let engine = test_engine();
    let item = engine.enqueue(NewItem::new("", "orphan", "d")).await.unwrap();
    engine.acquire_next("dead-worker").await.unwrap().unwrap();

    let table = StaleTimeouts {
        default_secs: 0,
        ..StaleTimeouts::default()
    };
    let report = engine.sweep(&table).await;

    assert_eq!(report.len(), 1);
    assert_eq!(report[0].item_type, "");
    assert_eq!(report[0].count, RequeueCount { succeeded: 1, total: 1 });
    assert_eq!(engine.store().partitions(item.id), vec![Partition::Enqueued]);
}

#[tokio::test]
async fn sweep_matches_table_entries_case_insensitively() {
    let engine = test_engine();
    let upper = acquired(&engine, "Email", "w1").await;
    let lower = acquired(&engine, "email", "w2").await;
    let mixed = acquired(&engine, "REPORT", "w3").await;
    let other = acquired(&engine, "report", "w4").await;

    let table = StaleTimeouts {
        default_secs: 0,
        ..StaleTimeouts::default()
    }
    .with_type("EMAIL", 3600);

    let report = engine.sweep(&table).await;

    // One line for the listed type, one for the two spellings of "report".
    let summary: Vec<(String, i64)> = report
        .iter()
        .map(|l| (l.item_type.to_lowercase(), l.count.succeeded))
        .collect();
    assert_eq!(
        summary,
        vec![("email".to_string(), 0), ("report".to_string(), 2)]
    );
    assert_eq!(engine.store().partitions(upper.id), vec![Partition::Acquired]);
    assert_eq!(engine.store().partitions(lower.id), vec![Partition::Acquired]);
    assert_eq!(engine.store().partitions(mixed.id), vec![Partition::Enqueued]);
    assert_eq!(engine.store().partitions(other.id), vec![Partition::Enqueued]);
}

#[tokio::test]
async fn stale_listings_ignore_type_case() {
    let engine = test_engine();
    let item = acquired(&engine, "Email", "w").await;
    let waiting = engine.enqueue(NewItem::new("Report", "e", "d")).await.unwrap();

    let acquired_ids = engine
        .list_stale_acquired(Some("EMAIL"), TimeDelta::zero())
        .await
        .unwrap();
    assert_eq!(acquired_ids, vec![item.id]);
    let enqueued_ids = engine
        .list_stale_enqueued(Some("report"), TimeDelta::zero())
        .await
        .unwrap();
    assert_eq!(enqueued_ids, vec![waiting.id]);
    assert_eq!(
        engine.requeue_stale(Some("email"), TimeDelta::zero()).await,
        RequeueCount { succeeded: 1, total: 1 }
    );
}
