mod common;

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use common::{customer, customer_ctx, event_ctx, purchase, run};
use tierflow::domain::{EntityKey, IngestMetadata, RawRecord};
use tierflow::pipeline::ingestion::MemoryAdapter;
use tierflow::pipeline::storage::{InMemoryTierStore, QuarantineStatus, SqliteTierStore, TierStore};
use tierflow::pipeline::StreamingController;

fn raw(offset: u64, fields: Value) -> RawRecord {
    let Value::Object(fields) = fields else {
        panic!("test rows are objects");
    };
    RawRecord::new(
        fields,
        IngestMetadata {
            source_id: "core".to_string(),
            ingested_at: Utc::now(),
            source_partition: "p0".to_string(),
            offset,
        },
    )
}

#[tokio::test]
async fn test_raw_append_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = SqliteTierStore::open(dir.path().join("tiers.db")).unwrap();

    let records = vec![raw(1, json!({"customer_id": "C1"})), raw(2, json!({"customer_id": "C2"}))];
    assert_eq!(store.append_raw(&records).await.unwrap(), 2);
    assert_eq!(store.append_raw(&records).await.unwrap(), 0);

    let stored = store.raw_record(&records[1].record_id).await.unwrap().unwrap();
    assert_eq!(stored.fields, records[1].fields);
    assert_eq!(stored.meta.offset, 2);
    assert!(store.raw_record("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_tiers_survive_reopening_the_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("tiers.db");
    let ctx = customer_ctx(2, "");

    {
        let store = SqliteTierStore::open(&path).unwrap();
        run(
            &ctx,
            &store,
            "core",
            vec![
                customer("C1", "2024-02-01", json!("52000")),
                customer("C1", "2024-01-01", json!("50000")),
                customer("C2", "2024-02-01", json!("not disclosed")),
            ],
        )
        .await;
    }

    let store = SqliteTierStore::open(&path).unwrap();
    let snapshot = store.canonical_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    let record = &snapshot[&EntityKey::new("C1")];
    assert_eq!(record.history.len(), 2);
    assert_eq!(record.current.observed_at.format("%Y-%m-%d").to_string(), "2024-02-01");

    let held = store.list_quarantine().await.unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].status, QuarantineStatus::Held);
    assert_eq!(held[0].rule_version, "test-1");
    assert_eq!(store.verdicts_for(&held[0].record.record_id).await.unwrap().len(), 3);

    let mut names = store.product_names().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["by_occupation", "profiles", "top_debtors"]);
    let profiles = store.latest_product("profiles").await.unwrap().unwrap();
    assert_eq!(profiles.version, 1);
    assert_eq!(profiles.rows.len(), 1);
}

#[tokio::test]
async fn test_sqlite_and_in_memory_stores_agree() {
    let dir = TempDir::new().unwrap();
    let sqlite = SqliteTierStore::open(dir.path().join("tiers.db")).unwrap();
    let memory = InMemoryTierStore::new();
    let ctx = customer_ctx(4, "");

    let rows: Vec<Value> = (0..12)
        .map(|i| customer(&format!("C{}", i % 5), &format!("2024-0{}-01", 1 + i % 3), json!(format!("{}", 1000 * i))))
        .collect();
    run(&ctx, &sqlite, "core", rows.clone()).await;
    run(&ctx, &memory, "core", rows).await;

    let a = sqlite.canonical_snapshot().await.unwrap();
    let b = memory.canonical_snapshot().await.unwrap();
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (key, record) in &a {
        assert_eq!(record.current.record_id, b[key].current.record_id);
        assert_eq!(record.history.len(), b[key].history.len());
    }

    for name in ["profiles", "top_debtors", "by_occupation"] {
        let x = sqlite.latest_product(name).await.unwrap().unwrap();
        let y = memory.latest_product(name).await.unwrap().unwrap();
        assert_eq!(x.columns, y.columns);
        assert_eq!(x.rows, y.rows);
    }
}

#[tokio::test]
async fn test_product_versions_accumulate() {
    let dir = TempDir::new().unwrap();
    let store = SqliteTierStore::open(dir.path().join("tiers.db")).unwrap();
    let ctx = customer_ctx(1, "");

    run(&ctx, &store, "core", vec![customer("C1", "2024-02-01", json!("1000"))]).await;
    let report = run(&ctx, &store, "core", vec![customer("C2", "2024-02-01", json!("2000"))]).await;
    assert_eq!(report.product_versions["profiles"], 2);

    let versions = store.product_versions("profiles").await.unwrap();
    assert_eq!(versions.iter().map(|t| t.version).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(versions[0].rows.len(), 1);
    assert_eq!(versions[1].rows.len(), 2);
}

#[tokio::test]
async fn test_quarantine_status_is_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tiers.db");
    let ctx = customer_ctx(1, "");

    let record_id = {
        let store = SqliteTierStore::open(&path).unwrap();
        run(&ctx, &store, "core", vec![customer("C9", "2024-02-01", json!("not disclosed"))]).await;
        let held = store.list_quarantine().await.unwrap();
        let id = held[0].record.record_id.clone();
        store
            .set_quarantine_status(&id, QuarantineStatus::Resubmitted { replacement_id: "r-1".to_string() })
            .await
            .unwrap();
        id
    };

    let store = SqliteTierStore::open(&path).unwrap();
    let entry = store.quarantine_entry(&record_id).await.unwrap().unwrap();
    assert_eq!(
        entry.status,
        QuarantineStatus::Resubmitted { replacement_id: "r-1".to_string() }
    );
}

#[tokio::test]
async fn test_streaming_resumes_from_persisted_checkpoint_and_window_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tiers.db");
    let ctx = event_ctx("reopen");
    let batches = vec![
        vec![purchase("a", "2024-05-01T10:00:00Z", 10)],
        vec![purchase("b", "2024-05-02T10:00:00Z", 20)],
        vec![purchase("c", "2024-05-01T23:00:00Z", 5)],
    ];

    {
        let store = SqliteTierStore::open(&path).unwrap();
        let mut source = MemoryAdapter::from_batches("shop", batches.clone());
        let report = StreamingController::new(&ctx, &store)
            .with_max_batches(2)
            .run(&mut source)
            .await
            .unwrap();
        assert_eq!(report.batches, 2);
    }

    let store = SqliteTierStore::open(&path).unwrap();
    assert_eq!(store.checkpoint("shop").await.unwrap().unwrap().offset, 2);

    let mut source = MemoryAdapter::from_batches("shop", batches);
    let report = StreamingController::new(&ctx, &store).run(&mut source).await.unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.late_observations, 1);

    let table = store.latest_product("daily_revenue").await.unwrap().unwrap();
    assert_eq!(table.version, 3);
    assert_eq!(table.value(0, "revenue"), Some(&json!(15)));
    assert_eq!(table.value(0, "revision"), Some(&json!(1)));
    assert_eq!(store.checkpoint("shop").await.unwrap().unwrap().offset, 3);

    let states = store.window_states().await.unwrap();
    assert!(states["daily_revenue"].watermark.is_some());
}

