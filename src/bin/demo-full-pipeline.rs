/// Demo: run both sample pipelines end to end against an in-memory tier store.
///
/// 1. Credit profiles: two batch loads over the same customers, showing gate routing,
///    late-arriving history, the `-999` income sentinel and quarantine resubmission.
/// 2. Click-stream events: a few synthetic micro-batches through the streaming controller.
use serde_json::{json, Value};
use tierflow::config::{PipelineConfig, RunContext};
use tierflow::metrics;
use tierflow::pipeline::audit::Auditor;
use tierflow::pipeline::ingestion::{MemoryAdapter, SyntheticEventAdapter};
use tierflow::pipeline::processing::aggregate::ProductTable;
use tierflow::pipeline::storage::{InMemoryTierStore, TierStore};
use tierflow::pipeline::{run_batch, RunReport, StreamingController};
use tracing_subscriber::EnvFilter;

const CREDIT_CONFIG: &str = include_str!("../../config/credit_profiles.toml");
const EVENT_CONFIG: &str = include_str!("../../config/event_stream.toml");

fn summarize(label: &str, report: &RunReport) {
    println!("   {}", label);
    println!(
        "   received={} accepted={} warned={} quarantined={} rejected={}",
        report.received, report.accepted, report.warned, report.quarantined, report.rejected
    );
    println!(
        "   entities_updated={} duplicates_collapsed={} degraded_fields={} late_observations={}",
        report.entities_updated, report.duplicates_collapsed, report.degraded_fields, report.late_observations
    );
    for failure in &report.products_failed {
        println!("   ⚠️  product {} failed: {}", failure.product, failure.reason);
    }
}

fn show(table: &ProductTable, max_rows: usize) {
    println!("\n   📊 {} v{} [{}]", table.product, table.version, table.columns.join(", "));
    for row in table.rows.iter().take(max_rows) {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("      {}", cells.join(" | "));
    }
    if table.rows.len() > max_rows {
        println!("      … {} more rows", table.rows.len() - max_rows);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    metrics::init_metrics();

    println!("\n🚀 FULL PIPELINE DEMO: raw → canonical → analytics");
    println!("{}", "=".repeat(60));

    // ---- credit profiles -------------------------------------------------------------
    let ctx = RunContext::new(PipelineConfig::from_toml_str(CREDIT_CONFIG)?)?;
    let store = InMemoryTierStore::new();

    println!("\n📥 STEP 1: February load");
    let february = vec![
        json!({"customer_id": "CUS_0x1", "as_of": "2024-02-01", "name": "  aaron   maashoh ",
               "age": "23_", "occupation": "software engineer", "annual_income": "$19,114.12",
               "outstanding_debt": "809.98", "credit_mix": "good",
               "credit_history_age": "22 Years and 1 Months"}),
        json!({"customer_id": "CUS_0x2", "as_of": "2024-02-01", "name": "rick rothackerj",
               "age": 28, "occupation": "Teacher", "annual_income": "-999",
               "outstanding_debt": "605.03", "credit_mix": "Standard",
               "credit_history_age": "NA"}),
        json!({"customer_id": "CUS_0x3", "as_of": "2024-02-01", "name": "Langep",
               "occupation": "astronaut", "annual_income": "not disclosed",
               "outstanding_debt": "1200"}),
        json!({"customer_id": "bogus", "as_of": "2024-02-01"}),
    ];
    let mut adapter = MemoryAdapter::new("core_banking", february, 100);
    let report = run_batch(&ctx, &store, &mut adapter).await?;
    summarize("February", &report);

    println!("\n📥 STEP 2: March load, plus a January observation arriving late");
    let march = vec![
        json!({"customer_id": "CUS_0x1", "as_of": "2024-03-01", "name": "Aaron Maashoh",
               "age": 23, "occupation": "Engineer", "annual_income": "19114.12",
               "outstanding_debt": "3200.50", "credit_mix": "Good",
               "credit_history_age": "22 Years and 2 Months"}),
        json!({"customer_id": "CUS_0x1", "as_of": "2024-01-01", "name": "Aaron Maashoh",
               "age": 23, "occupation": "Engineer", "annual_income": "18000",
               "outstanding_debt": "500", "credit_mix": "Good"}),
    ];
    let mut adapter = MemoryAdapter::new("bureau", march, 100);
    let report = run_batch(&ctx, &store, &mut adapter).await?;
    summarize("March", &report);

    println!("\n🩹 STEP 3: remediate quarantine");
    let auditor = Auditor::new(&ctx, &store);
    for entry in auditor.held().await? {
        println!("   held {}: {}", entry.record.record_id, entry.failures.join("; "));
        let mut fields = entry.record.fields.clone();
        fields.insert("annual_income".to_string(), json!("42000"));
        let resubmission = auditor.resubmit(&entry.record.record_id, fields).await?;
        println!("   resubmitted as {}", resubmission.replacement_id);
    }

    for name in store.product_names().await? {
        if let Some(table) = store.latest_product(&name).await? {
            show(&table, 8);
        }
    }

    // ---- click-stream events ---------------------------------------------------------
    println!("\n📡 STEP 4: streaming synthetic click-stream events");
    let ctx = RunContext::new(PipelineConfig::from_toml_str(EVENT_CONFIG)?)?;
    let store = InMemoryTierStore::new();
    let mut source = SyntheticEventAdapter::new("synthetic", 50, Some(4), 7).with_late_events(0.1, 1800);
    let report = StreamingController::new(&ctx, &store).run(&mut source).await?;
    summarize(&format!("{} micro-batches", report.batches), &report);

    for name in ["daily_revenue", "country_performance", "largest_orders"] {
        if let Some(table) = store.latest_product(name).await? {
            show(&table, 5);
        }
    }

    if let Some(text) = metrics::render() {
        let lines = text.lines().filter(|l| l.starts_with("tierflow_")).count();
        println!("\n📈 {} metric series recorded", lines);
    }

    println!("\n✅ Demo complete");
    Ok(())
}
