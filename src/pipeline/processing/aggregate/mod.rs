//! Aggregation engine: materializes the configured analytics products from the canonical tier.
//!
//! Each product is computed independently. A failing product yields an error for that product
//! only and no table is written for it, so the store keeps serving its last-known-good version.
//! An incremental windowed product also hands back a deferred state that queues the run's
//! observations for its next fold.

pub mod measures;
pub mod products;
pub mod windowed;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::domain::{CanonicalRecord, EntityKey, NormalizedRecord};
use crate::error::{PipelineError, Result};
pub use measures::{MeasureOp, MeasureSpec, Partial};
pub use products::RankOrder;
pub use windowed::{
    FoldStats, LatePolicy, RefreshMode, RejectedObservation, RowFilter, WindowSpec, WindowState, WindowedSpec,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductConfig {
    pub name: String,
    #[serde(flatten)]
    pub spec: ProductSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProductSpec {
    Snapshot {
        fields: Vec<String>,
    },
    Windowed(WindowedSpec),
    Segment {
        segment_by: Vec<String>,
        measures: Vec<MeasureSpec>,
    },
    Ranked {
        field: String,
        top_n: usize,
        #[serde(default)]
        order: RankOrder,
        /// Extra current fields carried into each ranked row
        #[serde(default)]
        include: Vec<String>,
    },
}

impl ProductSpec {
    pub fn kind(&self) -> ProductKind {
        match self {
            ProductSpec::Snapshot { .. } => ProductKind::Snapshot,
            ProductSpec::Windowed(_) => ProductKind::Windowed,
            ProductSpec::Segment { .. } => ProductKind::Segment,
            ProductSpec::Ranked { .. } => ProductKind::Ranked,
        }
    }

    /// Whether computing this product needs the complete canonical tier, not just this run's
    /// new observations
    pub fn needs_canonical_view(&self) -> bool {
        match self {
            ProductSpec::Windowed(spec) => spec.refresh == RefreshMode::Full,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Snapshot,
    Windowed,
    Segment,
    Ranked,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Snapshot => "snapshot",
            ProductKind::Windowed => "windowed",
            ProductKind::Segment => "segment",
            ProductKind::Ranked => "ranked",
        }
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A materialized, versioned analytics product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductTable {
    pub product: String,
    pub kind: ProductKind,
    pub run_id: String,
    /// Assigned by the store on commit; 0 until then
    pub version: u64,
    pub computed_at: DateTime<Utc>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ProductTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

/// What a run hands to the engine
pub struct AggregationInput<'a> {
    pub run_id: &'a str,
    pub computed_at: DateTime<Utc>,
    /// Complete canonical tier after this run's updates; empty when no product needs it
    pub canonical: &'a BTreeMap<EntityKey, CanonicalRecord>,
    /// Observations that entered canonical history in this run
    pub new_observations: &'a [NormalizedRecord],
}

#[derive(Debug, Clone)]
pub struct ProductOutput {
    pub table: ProductTable,
    /// New state to persist for windowed products
    pub window_state: Option<WindowState>,
    pub late_observations: usize,
    /// Backlog observations set aside because they fail on their own
    pub rejected_observations: usize,
}

#[derive(Debug)]
pub struct ProductOutcome {
    pub product: String,
    pub result: Result<ProductOutput>,
    /// On failure of an incremental windowed product: the prior state with this run's
    /// observations queued, to be persisted in place of a new state
    pub deferred_state: Option<WindowState>,
}

pub struct AggregationEngine {
    products: Vec<ProductConfig>,
}

impl AggregationEngine {
    pub fn new(products: Vec<ProductConfig>) -> Self {
        Self { products }
    }

    pub fn products(&self) -> &[ProductConfig] {
        &self.products
    }

    pub fn needs_canonical_view(&self) -> bool {
        self.products.iter().any(|p| p.spec.needs_canonical_view())
    }

    /// Compute every product. Products run in parallel; outcomes come back in config order.
    pub fn compute(
        &self,
        input: &AggregationInput<'_>,
        prior_states: &HashMap<String, WindowState>,
    ) -> Vec<ProductOutcome> {
        let current: Vec<&NormalizedRecord> = input.canonical.values().map(|c| &c.current).collect();
        self.products
            .par_iter()
            .map(|product| {
                let prior_state = prior_states.get(&product.name);
                let result = compute_product(product, input, &current, prior_state)
                    .map_err(|reason| PipelineError::aggregation(&product.name, reason));
                let mut deferred_state = None;
                if let Err(e) = &result {
                    tracing::warn!(product = %product.name, error = %e, "product computation failed");
                    if let ProductSpec::Windowed(spec) = &product.spec {
                        if spec.refresh == RefreshMode::Incremental {
                            let prior = prior_state.cloned().unwrap_or_default();
                            deferred_state = Some(windowed::defer(spec, &prior, input.new_observations));
                        }
                    }
                }
                ProductOutcome {
                    product: product.name.clone(),
                    result,
                    deferred_state,
                }
            })
            .collect()
    }
}

fn compute_product(
    product: &ProductConfig,
    input: &AggregationInput<'_>,
    current: &[&NormalizedRecord],
    prior_state: Option<&WindowState>,
) -> std::result::Result<ProductOutput, String> {
    let mut window_state = None;
    let mut late_observations = 0;
    let mut rejected_observations = 0;

    let (columns, rows) = match &product.spec {
        ProductSpec::Snapshot { fields } => products::snapshot(current, fields),
        ProductSpec::Segment { segment_by, measures } => products::segment(current, segment_by, measures)?,
        ProductSpec::Ranked {
            field,
            top_n,
            order,
            include,
        } => products::ranked(current, field, *top_n, *order, include)?,
        ProductSpec::Windowed(spec) => {
            let (state, stats) = match spec.refresh {
                RefreshMode::Incremental => {
                    let observations: Vec<&NormalizedRecord> = input.new_observations.iter().collect();
                    windowed::fold_with_backlog(spec, prior_state.unwrap_or(&WindowState::default()), &observations)?
                }
                RefreshMode::Full => {
                    let observations: Vec<&NormalizedRecord> = input
                        .canonical
                        .values()
                        .flat_map(|c| c.history.iter().map(|e| &e.record))
                        .collect();
                    windowed::fold(spec, &WindowState::default(), &observations)?
                }
            };
            late_observations = stats.late;
            rejected_observations = stats.rejected;
            let rows = windowed::rows(&state);
            window_state = Some(state);
            (spec.columns(), rows)
        }
    };

    Ok(ProductOutput {
        table: ProductTable {
            product: product.name.clone(),
            kind: product.spec.kind(),
            run_id: input.run_id.to_string(),
            version: 0,
            computed_at: input.computed_at,
            columns,
            rows,
        },
        window_state,
        late_observations,
        rejected_observations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FieldValue, HistoryEntry};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn products() -> Vec<ProductConfig> {
        #[derive(Deserialize)]
        struct Wrapper {
            products: Vec<ProductConfig>,
        }
        let w: Wrapper = toml::from_str(
            r#"
            [[products]]
            name = "profiles"
            kind = "snapshot"
            fields = ["occupation", "debt"]

            [[products]]
            name = "monthly_debt"
            kind = "windowed"
            window = "month"
            group_by = ["occupation"]
            measures = [
                { name = "observations", op = "count" },
                { name = "total_debt", op = "sum", field = "debt" },
            ]

            [[products]]
            name = "broken"
            kind = "segment"
            segment_by = ["occupation"]
            measures = [{ name = "nonsense", op = "sum", field = "occupation" }]

            [[products]]
            name = "top_debt"
            kind = "ranked"
            field = "debt"
            top_n = 2
            "#,
        )
        .unwrap();
        w.products
    }

    fn canonical(key: &str, debt: i64) -> CanonicalRecord {
        let entity = EntityKey::new(key);
        let mut fields = BTreeMap::new();
        fields.insert("occupation".to_string(), FieldValue::Text("Engineer".into()));
        fields.insert("debt".to_string(), FieldValue::Number(Decimal::from(debt)));
        let at = Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap();
        let record = NormalizedRecord {
            record_id: format!("r-{}", key),
            content_hash: NormalizedRecord::compute_content_hash(&entity, &fields),
            entity_key: entity.clone(),
            observed_at: at,
            ingested_at: at,
            source_id: "core".into(),
            fields,
            coerced: Default::default(),
            degraded: Default::default(),
            warnings: vec![],
        };
        CanonicalRecord {
            entity_key: entity,
            history: vec![HistoryEntry::from_record(record.clone())],
            current: record,
        }
    }

    #[test]
    fn test_products_parse_from_toml() {
        let p = products();
        assert_eq!(p.len(), 4);
        assert_eq!(p[1].spec.kind(), ProductKind::Windowed);
        match &p[1].spec {
            ProductSpec::Windowed(spec) => {
                assert_eq!(spec.window, WindowSpec::Month);
                assert_eq!(spec.late_policy, LatePolicy::Reopen);
                assert_eq!(spec.measures.len(), 2);
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[test]
    fn test_one_failing_product_does_not_block_others() {
        let engine = AggregationEngine::new(products());
        let mut tier = BTreeMap::new();
        for (k, d) in [("A", 10), ("B", 30), ("C", 20)] {
            tier.insert(EntityKey::new(k), canonical(k, d));
        }
        let new_obs: Vec<NormalizedRecord> = tier.values().map(|c| c.current.clone()).collect();
        let input = AggregationInput {
            run_id: "run-1",
            computed_at: Utc::now(),
            canonical: &tier,
            new_observations: &new_obs,
        };

        let outcomes = engine.compute(&input, &HashMap::new());
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_ok());
        assert!(matches!(outcomes[2].result, Err(PipelineError::Aggregation { .. })));
        assert!(outcomes[2].deferred_state.is_none());

        let top = outcomes[3].result.as_ref().unwrap();
        assert_eq!(top.table.value(0, "entity_key"), Some(&Value::from("B")));
        assert_eq!(top.table.value(1, "entity_key"), Some(&Value::from("C")));

        let monthly = outcomes[1].result.as_ref().unwrap();
        assert_eq!(monthly.table.value(0, "total_debt"), Some(&Value::from(60)));
        assert!(monthly.window_state.is_some());
    }
}
