use chrono::{Datelike, Timelike, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::numeric::decimal_from_f64;
use crate::domain::FieldValue;

static NULL: FieldValue = FieldValue::Null;

/// Columns computed from already-normalized fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivedField {
    /// Product of numeric fields, e.g. `total_value = quantity * amount`
    Product { name: String, factors: Vec<String> },
    /// Label from ascending `below` thresholds, e.g. amount category low/medium/high
    Bucket {
        name: String,
        field: String,
        thresholds: Vec<BucketThreshold>,
        otherwise: String,
    },
    /// 1 when the field equals one of `equals`, else 0
    Flag {
        name: String,
        field: String,
        equals: Vec<String>,
    },
    /// Calendar component of a timestamp field
    DatePart {
        name: String,
        field: String,
        part: DatePart,
    },
    /// Relabel values through a lookup, e.g. device category Mobile/Desktop. Nulls and values
    /// missing from `mapping` take `otherwise`.
    Map {
        name: String,
        field: String,
        mapping: BTreeMap<String, String>,
        otherwise: String,
    },
    /// Sum of per-value weights across terms, e.g. an engagement score
    Score { name: String, terms: Vec<ScoreTerm> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreTerm {
    pub field: String,
    /// Weight per value; unlisted values and nulls weigh 0
    pub weights: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketThreshold {
    pub below: f64,
    pub label: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatePart {
    Date,
    Hour,
    /// 1 = Sunday .. 7 = Saturday
    DayOfWeek,
    IsWeekend,
}

impl DerivedField {
    pub fn name(&self) -> &str {
        match self {
            DerivedField::Product { name, .. }
            | DerivedField::Bucket { name, .. }
            | DerivedField::Flag { name, .. }
            | DerivedField::DatePart { name, .. }
            | DerivedField::Map { name, .. }
            | DerivedField::Score { name, .. } => name,
        }
    }

    /// Compute the derived value. Returns a warning alongside when the inputs could not be combined.
    pub fn compute(&self, fields: &BTreeMap<String, FieldValue>) -> (FieldValue, Option<String>) {
        let get = |name: &str| fields.get(name).unwrap_or(&NULL);
        match self {
            DerivedField::Product { name, factors } => {
                let mut acc = Decimal::ONE;
                for factor in factors {
                    let Some(value) = get(factor).as_decimal() else {
                        return (FieldValue::Null, None);
                    };
                    match acc.checked_mul(value) {
                        Some(next) => acc = next,
                        None => {
                            return (
                                FieldValue::Null,
                                Some(format!("derived field '{}' overflowed", name)),
                            )
                        }
                    }
                }
                (FieldValue::Number(acc.normalize()), None)
            }
            DerivedField::Bucket {
                field,
                thresholds,
                otherwise,
                ..
            } => {
                let Some(value) = get(field).as_decimal() else {
                    return (FieldValue::Null, None);
                };
                let label = thresholds
                    .iter()
                    .find(|t| decimal_from_f64(t.below).map_or(false, |below| value < below))
                    .map(|t| t.label.clone())
                    .unwrap_or_else(|| otherwise.clone());
                (FieldValue::Text(label), None)
            }
            DerivedField::Flag { field, equals, .. } => {
                let value = get(field);
                if value.is_null() {
                    return (FieldValue::Null, None);
                }
                let label = value.group_label();
                let hit = equals.iter().any(|e| e.eq_ignore_ascii_case(&label));
                (
                    FieldValue::Number(if hit { Decimal::ONE } else { Decimal::ZERO }),
                    None,
                )
            }
            DerivedField::DatePart { field, part, .. } => {
                let Some(ts) = get(field).as_timestamp() else {
                    return (FieldValue::Null, None);
                };
                let value = match part {
                    DatePart::Date => FieldValue::Text(ts.date_naive().format("%Y-%m-%d").to_string()),
                    DatePart::Hour => FieldValue::Number(Decimal::from(ts.hour())),
                    DatePart::DayOfWeek => {
                        FieldValue::Number(Decimal::from(ts.weekday().number_from_sunday()))
                    }
                    DatePart::IsWeekend => {
                        FieldValue::Bool(matches!(ts.weekday(), Weekday::Sat | Weekday::Sun))
                    }
                };
                (value, None)
            }
            DerivedField::Map {
                field,
                mapping,
                otherwise,
                ..
            } => {
                let value = get(field);
                let label = if value.is_null() {
                    None
                } else {
                    let raw = value.group_label();
                    mapping
                        .iter()
                        .find(|(from, _)| from.eq_ignore_ascii_case(&raw))
                        .map(|(_, to)| to.clone())
                };
                (FieldValue::Text(label.unwrap_or_else(|| otherwise.clone())), None)
            }
            DerivedField::Score { name, terms } => {
                let mut total = Decimal::ZERO;
                for term in terms {
                    let value = get(&term.field);
                    if value.is_null() {
                        continue;
                    }
                    let raw = value.group_label();
                    let Some(weight) = term
                        .weights
                        .iter()
                        .find(|(v, _)| v.eq_ignore_ascii_case(&raw))
                        .map(|(_, w)| *w)
                    else {
                        continue;
                    };
                    match decimal_from_f64(weight) {
                        Some(w) => total += w,
                        None => {
                            return (
                                FieldValue::Null,
                                Some(format!("derived field '{}' has a non-finite weight", name)),
                            )
                        }
                    }
                }
                (FieldValue::Number(total.normalize()), None)
            }
        }
    }
}
