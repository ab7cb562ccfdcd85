//! Measures and their associative partial aggregates.
//!
//! Every partial is exact (decimal) and merges commutatively, so folding observations in any
//! batch order yields the same final value.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::constants::ENTITY_KEY_GROUP;
use crate::domain::{decimal_to_json, FieldValue, NormalizedRecord};

/// Output precision for averages and ratios
const DERIVED_SCALE: u32 = 6;

static NULL: FieldValue = FieldValue::Null;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasureSpec {
    /// Output column name
    pub name: String,
    #[serde(flatten)]
    pub op: MeasureOp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MeasureOp {
    Count,
    Sum { field: String },
    Avg { field: String },
    Min { field: String },
    Max { field: String },
    DistinctCount { field: String },
    /// Sum of a 0/1 flag over the row count, as a percentage (conversion rate)
    Ratio { field: String },
    /// Row count divided by the distinct values of `field`, e.g. events per session
    PerDistinct { field: String },
}

impl MeasureOp {
    pub fn field(&self) -> Option<&str> {
        match self {
            MeasureOp::Count => None,
            MeasureOp::Sum { field }
            | MeasureOp::Avg { field }
            | MeasureOp::Min { field }
            | MeasureOp::Max { field }
            | MeasureOp::DistinctCount { field }
            | MeasureOp::Ratio { field }
            | MeasureOp::PerDistinct { field } => Some(field),
        }
    }
}

/// Mergeable intermediate state of one measure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Partial {
    Count { n: u64 },
    Sum { sum: Decimal, n: u64 },
    Avg { sum: Decimal, n: u64 },
    Min { value: Option<Decimal> },
    Max { value: Option<Decimal> },
    DistinctCount { values: BTreeSet<String> },
    Ratio { hits: Decimal, n: u64 },
    PerDistinct { values: BTreeSet<String>, n: u64 },
}

impl Partial {
    pub fn empty(op: &MeasureOp) -> Self {
        match op {
            MeasureOp::Count => Partial::Count { n: 0 },
            MeasureOp::Sum { .. } => Partial::Sum { sum: Decimal::ZERO, n: 0 },
            MeasureOp::Avg { .. } => Partial::Avg { sum: Decimal::ZERO, n: 0 },
            MeasureOp::Min { .. } => Partial::Min { value: None },
            MeasureOp::Max { .. } => Partial::Max { value: None },
            MeasureOp::DistinctCount { .. } => Partial::DistinctCount { values: BTreeSet::new() },
            MeasureOp::Ratio { .. } => Partial::Ratio { hits: Decimal::ZERO, n: 0 },
            MeasureOp::PerDistinct { .. } => Partial::PerDistinct { values: BTreeSet::new(), n: 0 },
        }
    }

    /// Fold one value in. Nulls are skipped; a non-numeric value for a numeric measure is an error.
    pub fn fold(&mut self, value: &FieldValue) -> Result<(), String> {
        match self {
            Partial::Count { n } => *n += 1,
            Partial::DistinctCount { values } => {
                if !value.is_null() {
                    values.insert(value.group_label());
                }
            }
            Partial::PerDistinct { values, n } => {
                *n += 1;
                if !value.is_null() {
                    values.insert(value.group_label());
                }
            }
            Partial::Ratio { hits, n } => {
                *n += 1;
                if let Some(d) = numeric(value)? {
                    *hits += d;
                }
            }
            Partial::Sum { sum, n } | Partial::Avg { sum, n } => {
                if let Some(d) = numeric(value)? {
                    *sum += d;
                    *n += 1;
                }
            }
            Partial::Min { value: current } => {
                if let Some(d) = numeric(value)? {
                    *current = Some(current.map_or(d, |c| c.min(d)));
                }
            }
            Partial::Max { value: current } => {
                if let Some(d) = numeric(value)? {
                    *current = Some(current.map_or(d, |c| c.max(d)));
                }
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &Partial) {
        match (self, other) {
            (Partial::Count { n }, Partial::Count { n: m }) => *n += m,
            (Partial::Sum { sum, n }, Partial::Sum { sum: s, n: m })
            | (Partial::Avg { sum, n }, Partial::Avg { sum: s, n: m }) => {
                *sum += *s;
                *n += m;
            }
            (Partial::Min { value }, Partial::Min { value: other }) => {
                *value = match (*value, *other) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            (Partial::Max { value }, Partial::Max { value: other }) => {
                *value = match (*value, *other) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                }
            }
            (Partial::DistinctCount { values }, Partial::DistinctCount { values: other }) => {
                values.extend(other.iter().cloned())
            }
            (Partial::Ratio { hits, n }, Partial::Ratio { hits: h, n: m }) => {
                *hits += *h;
                *n += m;
            }
            (Partial::PerDistinct { values, n }, Partial::PerDistinct { values: other, n: m }) => {
                values.extend(other.iter().cloned());
                *n += m;
            }
            (mine, theirs) => {
                tracing::warn!(?mine, ?theirs, "ignoring merge of mismatched partials");
            }
        }
    }

    pub fn finalize(&self) -> Value {
        match self {
            Partial::Count { n } => Value::from(*n),
            Partial::Sum { sum, n } => {
                if *n == 0 {
                    Value::Null
                } else {
                    decimal_to_json(*sum)
                }
            }
            Partial::Avg { sum, n } => {
                if *n == 0 {
                    Value::Null
                } else {
                    decimal_to_json((*sum / Decimal::from(*n)).round_dp(DERIVED_SCALE))
                }
            }
            Partial::Min { value } | Partial::Max { value } => {
                value.map(decimal_to_json).unwrap_or(Value::Null)
            }
            Partial::DistinctCount { values } => Value::from(values.len() as u64),
            Partial::Ratio { hits, n } => {
                if *n == 0 {
                    Value::Null
                } else {
                    decimal_to_json((*hits * Decimal::ONE_HUNDRED / Decimal::from(*n)).round_dp(DERIVED_SCALE))
                }
            }
            Partial::PerDistinct { values, n } => {
                if values.is_empty() {
                    Value::Null
                } else {
                    let distinct = Decimal::from(values.len() as u64);
                    decimal_to_json((Decimal::from(*n) / distinct).round_dp(DERIVED_SCALE))
                }
            }
        }
    }
}

fn numeric(value: &FieldValue) -> Result<Option<Decimal>, String> {
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::Number(d) => Ok(Some(*d)),
        FieldValue::Bool(b) => Ok(Some(if *b { Decimal::ONE } else { Decimal::ZERO })),
        other => Err(format!("expected a numeric value, found {}", other.group_label())),
    }
}

/// One partial per measure, folded from records. `@entity_key` measures the record's key.
pub fn fold_record(
    partials: &mut [Partial],
    measures: &[MeasureSpec],
    record: &NormalizedRecord,
) -> Result<(), String> {
    let entity_key = FieldValue::Text(record.entity_key.to_string());
    for (partial, measure) in partials.iter_mut().zip(measures) {
        let value = match measure.op.field() {
            Some(ENTITY_KEY_GROUP) => &entity_key,
            Some(f) => record.field(f),
            None => &NULL,
        };
        partial
            .fold(value)
            .map_err(|e| format!("measure '{}': {}", measure.name, e))?;
    }
    Ok(())
}

pub fn empty_partials(measures: &[MeasureSpec]) -> Vec<Partial> {
    measures.iter().map(|m| Partial::empty(&m.op)).collect()
}
