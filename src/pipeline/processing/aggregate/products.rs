//! Products computed from the full current snapshot: projections, segment rollups and rankings.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::measures::{empty_partials, fold_record, MeasureSpec, Partial};
use crate::constants::{COL_ENTITY_KEY, COL_OBSERVED_AT, COL_RANK};
use crate::domain::{FieldValue, NormalizedRecord};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    #[default]
    Desc,
    Asc,
}

/// Table body: column names plus rows aligned with them
pub type Rows = (Vec<String>, Vec<Vec<Value>>);

/// Per-entity projection of the current canonical records, ordered by entity key
pub fn snapshot(current: &[&NormalizedRecord], fields: &[String]) -> Rows {
    let mut columns = vec![COL_ENTITY_KEY.to_string(), COL_OBSERVED_AT.to_string()];
    columns.extend(fields.iter().cloned());

    let rows = current
        .iter()
        .map(|record| {
            let mut row = vec![
                Value::String(record.entity_key.to_string()),
                Value::String(record.observed_at.to_rfc3339()),
            ];
            row.extend(fields.iter().map(|f| record.field(f).to_output_json()));
            row
        })
        .collect();
    (columns, rows)
}

/// Group the current snapshot by categorical fields and aggregate each group
pub fn segment(
    current: &[&NormalizedRecord],
    segment_by: &[String],
    measures: &[MeasureSpec],
) -> Result<Rows, String> {
    let mut groups: BTreeMap<Vec<String>, Vec<Partial>> = BTreeMap::new();
    for record in current {
        let labels = segment_by
            .iter()
            .map(|f| record.field(f).group_label())
            .collect::<Vec<_>>();
        let partials = groups
            .entry(labels)
            .or_insert_with(|| empty_partials(measures));
        fold_record(partials, measures, record)?;
    }

    let mut columns = segment_by.to_vec();
    columns.extend(measures.iter().map(|m| m.name.clone()));
    let rows = groups
        .into_iter()
        .map(|(labels, partials)| {
            let mut row: Vec<Value> = labels.into_iter().map(Value::String).collect();
            row.extend(partials.iter().map(Partial::finalize));
            row
        })
        .collect();
    Ok((columns, rows))
}

/// Top-N current records by a numeric field. Ties break on entity key ascending; records with
/// a null ranking value are left out.
pub fn ranked(
    current: &[&NormalizedRecord],
    field: &str,
    top_n: usize,
    order: RankOrder,
    include: &[String],
) -> Result<Rows, String> {
    let mut scored: Vec<(Decimal, &NormalizedRecord)> = Vec::new();
    for record in current {
        match record.field(field) {
            FieldValue::Null => {}
            FieldValue::Number(d) => scored.push((*d, *record)),
            other => {
                return Err(format!(
                    "ranking field '{}' is not numeric for entity {} ({})",
                    field,
                    record.entity_key,
                    other.group_label()
                ))
            }
        }
    }

    scored.sort_by(|(a, ra), (b, rb)| {
        let by_value = match order {
            RankOrder::Desc => b.cmp(a),
            RankOrder::Asc => a.cmp(b),
        };
        match by_value {
            Ordering::Equal => ra.entity_key.cmp(&rb.entity_key),
            other => other,
        }
    });

    let mut columns = vec![COL_RANK.to_string(), COL_ENTITY_KEY.to_string(), field.to_string()];
    columns.extend(include.iter().cloned());

    let rows = scored
        .into_iter()
        .take(top_n)
        .enumerate()
        .map(|(i, (value, record))| {
            let mut row = vec![
                Value::from(i as u64 + 1),
                Value::String(record.entity_key.to_string()),
                crate::domain::decimal_to_json(value),
            ];
            row.extend(include.iter().map(|f| record.field(f).to_output_json()));
            row
        })
        .collect();
    Ok((columns, rows))
}
