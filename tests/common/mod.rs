#![allow(dead_code)]

use serde_json::{json, Value};

use tierflow::config::{PipelineConfig, RunContext};
use tierflow::domain::{CanonicalRecord, EntityKey};
use tierflow::pipeline::ingestion::MemoryAdapter;
use tierflow::pipeline::storage::TierStore;
use tierflow::pipeline::{run_batch, RunReport};

const CUSTOMER_BASE: &str = r#"
[schema]
entity_key = "customer_id"
observed_at = "as_of"

[[schema.fields]]
kind = "numeric"
name = "annual_income"
min = 0

[[schema.fields]]
kind = "numeric"
name = "outstanding_debt"
min = 0

[[schema.fields]]
kind = "categorical"
name = "occupation"
vocabulary = "occupation"

[[schema.fields]]
kind = "string"
name = "note"

[rules]
version = "test-1"

[[rules.rule]]
name = "customer_id_present"
field = "customer_id"
severity = "reject"
kind = "not_null"

[[rules.rule]]
name = "income_numeric"
field = "annual_income"
severity = "quarantine"
kind = "numeric"

[[rules.rule]]
name = "income_non_negative"
field = "annual_income"
severity = "warn"
kind = "range"
min = 0

[vocabularies.occupation]
"software engineer" = "Engineer"
"teacher" = "Teacher"

[[products]]
name = "profiles"
kind = "snapshot"
fields = ["annual_income", "occupation"]

[[products]]
name = "top_debtors"
kind = "ranked"
field = "outstanding_debt"
top_n = 5

[[products]]
name = "by_occupation"
kind = "segment"
segment_by = ["occupation"]
measures = [
    { name = "customers", op = "count" },
    { name = "avg_income", op = "avg", field = "annual_income" },
]
"#;

const EVENT_BASE: &str = r#"
[schema]
entity_key = "event_id"
observed_at = "ts"

[[schema.fields]]
kind = "categorical"
name = "event_type"
vocabulary = "event_type"

[[schema.fields]]
kind = "numeric"
name = "amount"
min = 0

[[schema.fields]]
kind = "string"
name = "note"

[rules]
version = "events-test"

[[rules.rule]]
name = "event_id_present"
field = "event_id"
severity = "reject"
kind = "not_null"

[vocabularies.event_type]
purchase = "purchase"
view = "view"

[streaming]
batch_size = 100
max_retries = 2
backoff_ms = 1
max_backoff_ms = 5
"#;

/// Customer pipeline with `workers` shards plus any extra TOML appended (products, overrides)
pub fn customer_ctx(workers: usize, extra: &str) -> RunContext {
    let toml = format!("[pipeline]\nworkers = {}\n{}\n{}", workers, CUSTOMER_BASE, extra);
    RunContext::new(PipelineConfig::from_toml_str(&toml).unwrap()).unwrap()
}

/// Customer pipeline under a later rule set that no longer quarantines non-numeric income
pub fn relaxed_customer_ctx() -> RunContext {
    let base = CUSTOMER_BASE
        .replace(
            "[[rules.rule]]\nname = \"income_numeric\"\nfield = \"annual_income\"\nseverity = \"quarantine\"\nkind = \"numeric\"\n",
            "",
        )
        .replace("version = \"test-1\"", "version = \"test-2\"");
    let toml = format!("[pipeline]\nworkers = 1\n{}", base);
    RunContext::new(PipelineConfig::from_toml_str(&toml).unwrap()).unwrap()
}

/// Event pipeline with only the given products
pub fn event_ctx_with(products: &str) -> RunContext {
    let toml = format!("{}\n{}", EVENT_BASE, products);
    RunContext::new(PipelineConfig::from_toml_str(&toml).unwrap()).unwrap()
}

/// Event pipeline with a daily purchase-revenue product using the given late-data policy
pub fn event_ctx(late_policy: &str) -> RunContext {
    let toml = format!(
        r#"{}
[[products]]
name = "daily_revenue"
kind = "windowed"
window = "day"
filter = {{ field = "event_type", values = ["purchase"] }}
allowed_lateness_secs = 0
late_policy = "{}"
measures = [
    {{ name = "purchases", op = "count" }},
    {{ name = "revenue", op = "sum", field = "amount" }},
]
"#,
        EVENT_BASE, late_policy
    );
    RunContext::new(PipelineConfig::from_toml_str(&toml).unwrap()).unwrap()
}

pub fn customer(id: &str, as_of: &str, income: Value) -> Value {
    json!({
        "customer_id": id,
        "as_of": as_of,
        "annual_income": income,
        "outstanding_debt": "100",
        "occupation": "software engineer",
    })
}

pub fn purchase(id: &str, ts: &str, amount: i64) -> Value {
    json!({ "event_id": id, "ts": ts, "event_type": "purchase", "amount": amount.to_string() })
}

pub async fn run(ctx: &RunContext, store: &dyn TierStore, source: &str, rows: Vec<Value>) -> RunReport {
    let mut adapter = MemoryAdapter::new(source, rows, 100);
    run_batch(ctx, store, &mut adapter).await.unwrap()
}

pub async fn canonical(store: &dyn TierStore, key: &str) -> Option<CanonicalRecord> {
    store
        .load_canonical(&[EntityKey::new(key)])
        .await
        .unwrap()
        .remove(&EntityKey::new(key))
}
