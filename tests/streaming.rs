mod common;

use serde_json::{json, Value};
use tokio::sync::watch;

use common::{event_ctx, event_ctx_with, purchase};
use tierflow::pipeline::ingestion::MemoryAdapter;
use tierflow::pipeline::processing::aggregate::ProductTable;
use tierflow::pipeline::storage::{InMemoryTierStore, TierStore};
use tierflow::pipeline::{SourceStatus, StreamingController};

fn morning_purchases() -> (Vec<Value>, Vec<Value>) {
    let early = vec![
        purchase("e01", "2024-05-01T09:00:00Z", 50),
        purchase("e02", "2024-05-01T09:05:00Z", 50),
    ];
    let later = (0..10)
        .map(|i| purchase(&format!("e1{}", i), &format!("2024-05-01T10:0{}:00Z", i), 50))
        .collect();
    (early, later)
}

async fn daily_revenue(store: &dyn TierStore) -> ProductTable {
    store.latest_product("daily_revenue").await.unwrap().unwrap()
}

#[tokio::test]
async fn test_purchases_today_accumulate_across_micro_batches() {
    let ctx = event_ctx("reopen");
    let store = InMemoryTierStore::new();
    let (early, later) = morning_purchases();

    let mut source = MemoryAdapter::from_batches("shop", vec![early.clone(), later.clone()]);
    let first = StreamingController::new(&ctx, &store)
        .with_max_batches(1)
        .run(&mut source)
        .await
        .unwrap();
    assert_eq!(first.batches, 1);
    let table = daily_revenue(&store).await;
    assert_eq!(table.value(0, "purchases"), Some(&json!(2)));
    assert_eq!(table.value(0, "revenue"), Some(&json!(100)));

    // a fresh reader over the same source resumes after the committed checkpoint
    let mut source = MemoryAdapter::from_batches("shop", vec![early, later]);
    let second = StreamingController::new(&ctx, &store).run(&mut source).await.unwrap();
    assert_eq!(second.batches, 1);
    assert_eq!(second.received, 10);
    assert_eq!(second.source_status, SourceStatus::Completed);

    let table = daily_revenue(&store).await;
    assert_eq!(table.version, 2);
    assert_eq!(table.rows.len(), 1);
    assert_eq!(table.value(0, "purchases"), Some(&json!(12)));
    assert_eq!(table.value(0, "revenue"), Some(&json!(600)));

    let checkpoint = store.checkpoint("shop").await.unwrap().unwrap();
    assert_eq!(checkpoint.offset, 12);
}

#[tokio::test]
async fn test_windowed_totals_do_not_depend_on_batch_partition() {
    let (early, later) = morning_purchases();
    let all: Vec<Value> = early.into_iter().chain(later).collect();

    let ctx = event_ctx("reopen");
    let whole = InMemoryTierStore::new();
    let mut source = MemoryAdapter::from_batches("shop", vec![all.clone()]);
    StreamingController::new(&ctx, &whole).run(&mut source).await.unwrap();

    let mut reversed = all;
    reversed.reverse();
    let pieces = InMemoryTierStore::new();
    let mut source = MemoryAdapter::new("shop", reversed, 3);
    let report = StreamingController::new(&ctx, &pieces).run(&mut source).await.unwrap();
    assert_eq!(report.batches, 4);

    assert_eq!(daily_revenue(&whole).await.rows, daily_revenue(&pieces).await.rows);
}

#[tokio::test]
async fn test_late_purchase_reopens_finalized_window() {
    let ctx = event_ctx("reopen");
    let store = InMemoryTierStore::new();
    let mut source = MemoryAdapter::from_batches(
        "shop",
        vec![
            vec![purchase("a", "2024-05-01T10:00:00Z", 10)],
            vec![purchase("b", "2024-05-02T10:00:00Z", 20)],
            vec![purchase("c", "2024-05-01T23:00:00Z", 5)],
        ],
    );
    let report = StreamingController::new(&ctx, &store).run(&mut source).await.unwrap();
    assert_eq!(report.late_observations, 1);

    let table = daily_revenue(&store).await;
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.value(0, "revenue"), Some(&json!(15)));
    assert_eq!(table.value(0, "revision"), Some(&json!(1)));
    assert_eq!(table.value(1, "revenue"), Some(&json!(20)));
    assert_eq!(table.value(1, "revision"), Some(&json!(0)));
}

#[tokio::test]
async fn test_late_purchase_under_correction_policy_emits_correction_row() {
    let ctx = event_ctx("correction");
    let store = InMemoryTierStore::new();
    let mut source = MemoryAdapter::from_batches(
        "shop",
        vec![
            vec![purchase("a", "2024-05-01T10:00:00Z", 10)],
            vec![purchase("b", "2024-05-02T10:00:00Z", 20)],
            vec![purchase("c", "2024-05-01T23:00:00Z", 5)],
        ],
    );
    StreamingController::new(&ctx, &store).run(&mut source).await.unwrap();

    let table = daily_revenue(&store).await;
    assert_eq!(table.rows.len(), 3);
    assert_eq!(table.value(0, "revenue"), Some(&json!(10)));
    assert_eq!(table.value(0, "correction"), Some(&json!(false)));
    assert_eq!(table.value(1, "revenue"), Some(&json!(5)));
    assert_eq!(table.value(1, "correction"), Some(&json!(true)));
    assert_eq!(table.value(2, "revenue"), Some(&json!(20)));
}

#[tokio::test]
async fn test_transient_read_failures_are_retried() {
    let ctx = event_ctx("reopen");
    let store = InMemoryTierStore::new();
    let (early, _) = morning_purchases();
    let mut source = MemoryAdapter::from_batches("shop", vec![early]).with_transient_failures(2);

    let report = StreamingController::new(&ctx, &store).run(&mut source).await.unwrap();
    assert_eq!(report.source_status, SourceStatus::Completed);
    assert_eq!(report.batches, 1);
    assert_eq!(report.accepted, 2);
}

#[tokio::test]
async fn test_exhausted_retries_mark_source_stalled() {
    let ctx = event_ctx("reopen");
    let store = InMemoryTierStore::new();
    let (early, _) = morning_purchases();
    let mut source = MemoryAdapter::from_batches("shop", vec![early]).with_transient_failures(10);

    let report = StreamingController::new(&ctx, &store).run(&mut source).await.unwrap();
    match &report.source_status {
        SourceStatus::Stalled { attempts, last_error } => {
            assert_eq!(*attempts, 3);
            assert!(last_error.contains("shop"));
        }
        other => panic!("expected a stalled source, got {:?}", other),
    }
    assert!(report.has_failures());
    assert!(store.checkpoint("shop").await.unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_signal_stops_before_next_batch() {
    let ctx = event_ctx("reopen");
    let store = InMemoryTierStore::new();
    let (early, later) = morning_purchases();
    let mut source = MemoryAdapter::from_batches("shop", vec![early, later]);

    let (_tx, rx) = watch::channel(true);
    let report = StreamingController::new(&ctx, &store)
        .with_shutdown(rx)
        .run(&mut source)
        .await
        .unwrap();
    assert_eq!(report.source_status, SourceStatus::Cancelled);
    assert_eq!(report.batches, 0);
    assert!(store.latest_product("daily_revenue").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_windowed_batch_is_folded_once_the_product_recovers() {
    let ctx = event_ctx_with(
        r#"
[[products]]
name = "daily_activity"
kind = "windowed"
window = "day"
measures = [
    { name = "events", op = "count" },
    { name = "peak_note", op = "max", field = "note" },
]
"#,
    );
    let store = InMemoryTierStore::new();
    let mut flagged = purchase("d", "2024-05-01T10:03:00Z", 5);
    flagged["note"] = json!("vip");
    let mut source = MemoryAdapter::from_batches(
        "shop",
        vec![
            vec![purchase("a", "2024-05-01T10:00:00Z", 5), purchase("b", "2024-05-01T10:01:00Z", 5)],
            vec![purchase("c", "2024-05-01T10:02:00Z", 5), flagged],
            vec![purchase("e", "2024-05-01T10:04:00Z", 5)],
        ],
    );

    let report = StreamingController::new(&ctx, &store).run(&mut source).await.unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.products_failed.len(), 1);
    assert!(report.products_failed[0].reason.contains("peak_note"));
    assert_eq!(report.observations_set_aside, 1);

    let table = store.latest_product("daily_activity").await.unwrap().unwrap();
    assert_eq!(table.version, 2);
    assert_eq!(table.value(0, "events"), Some(&json!(4)));

    let state = &store.window_states().await.unwrap()["daily_activity"];
    assert!(state.pending.is_empty());
    assert_eq!(state.rejected.len(), 1);
    assert!(state.rejected[0].reason.contains("found vip"));
}
