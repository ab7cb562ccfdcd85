//! Cleansing & normalization: accepted raw records become typed, canonical records.
//!
//! Every transform here is deterministic and idempotent: feeding a normalized record back
//! through [`Normalizer::renormalize`] yields the same record, which is what makes replaying a
//! micro-batch safe.

pub mod derive;
pub mod numeric;
pub mod vocabulary;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::domain::{EntityKey, FieldValue, NormalizedRecord, RawRecord};
use crate::error::{PipelineError, Result};
pub use derive::DerivedField;
use numeric::{decimal_from_f64, parse_decorated_decimal};
pub use vocabulary::{Vocabularies, VocabularyMatch};

/// Schema section of the pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Raw field holding the entity key
    pub entity_key: String,
    /// Raw field holding the observation timestamp
    pub observed_at: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub derived: Vec<DerivedField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSpec {
    String {
        name: String,
        #[serde(default)]
        case: CaseStyle,
    },
    Numeric {
        name: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        out_of_range: OutOfRange,
        #[serde(default)]
        integer: bool,
    },
    Categorical {
        name: String,
        vocabulary: String,
    },
    Nested {
        name: String,
        /// Regex with named captures, one per subfield, for string-encoded blobs
        #[serde(default)]
        pattern: Option<String>,
        subfields: Vec<SubfieldSpec>,
        #[serde(default)]
        required: bool,
    },
    Timestamp {
        name: String,
    },
    Boolean {
        name: String,
    },
}

impl FieldSpec {
    pub fn name(&self) -> &str {
        match self {
            FieldSpec::String { name, .. }
            | FieldSpec::Numeric { name, .. }
            | FieldSpec::Categorical { name, .. }
            | FieldSpec::Nested { name, .. }
            | FieldSpec::Timestamp { name }
            | FieldSpec::Boolean { name } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseStyle {
    Lower,
    Upper,
    Title,
    #[default]
    Preserve,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRange {
    #[default]
    Null,
    Clamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubfieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: SubfieldKind,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubfieldKind {
    #[default]
    Numeric,
    String,
}

/// Trait for turning gate-accepted raw records into canonical typed records
pub trait Normalizer: Send + Sync {
    /// Normalize a raw record. Fails only when the entity key or a required field is unusable.
    fn normalize(&self, record: &RawRecord) -> Result<NormalizedRecord>;

    /// Run an already-normalized record through the same transforms again
    fn renormalize(&self, record: &NormalizedRecord) -> Result<NormalizedRecord>;
}

enum CompiledField {
    String {
        name: String,
        case: CaseStyle,
    },
    Numeric {
        name: String,
        min: Option<Decimal>,
        max: Option<Decimal>,
        out_of_range: OutOfRange,
        integer: bool,
    },
    Categorical {
        name: String,
        vocabulary: String,
    },
    Nested {
        name: String,
        pattern: Option<Regex>,
        subfields: Vec<SubfieldSpec>,
        required: bool,
    },
    Timestamp {
        name: String,
    },
    Boolean {
        name: String,
    },
}

/// Field-level bookkeeping collected while normalizing one record
#[derive(Default)]
struct FieldNotes {
    coerced: BTreeSet<String>,
    degraded: BTreeSet<String>,
    warnings: Vec<String>,
}

impl FieldNotes {
    fn warn(&mut self, warning: String) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

/// Schema-driven normalizer built from the run's configuration
pub struct SchemaNormalizer {
    entity_key_field: String,
    observed_at_field: String,
    fields: Vec<CompiledField>,
    derived: Vec<DerivedField>,
    vocabularies: Arc<Vocabularies>,
}

impl SchemaNormalizer {
    pub fn from_config(schema: &SchemaConfig, vocabularies: Arc<Vocabularies>) -> Result<Self> {
        let mut fields = Vec::with_capacity(schema.fields.len());
        for spec in &schema.fields {
            fields.push(match spec {
                FieldSpec::String { name, case } => CompiledField::String {
                    name: name.clone(),
                    case: *case,
                },
                FieldSpec::Numeric {
                    name,
                    min,
                    max,
                    out_of_range,
                    integer,
                } => CompiledField::Numeric {
                    name: name.clone(),
                    min: min.and_then(decimal_from_f64),
                    max: max.and_then(decimal_from_f64),
                    out_of_range: *out_of_range,
                    integer: *integer,
                },
                FieldSpec::Categorical { name, vocabulary } => {
                    if !vocabularies.contains(vocabulary) {
                        return Err(PipelineError::Config(format!(
                            "field '{}' references unknown vocabulary '{}'",
                            name, vocabulary
                        )));
                    }
                    CompiledField::Categorical {
                        name: name.clone(),
                        vocabulary: vocabulary.clone(),
                    }
                }
                FieldSpec::Nested {
                    name,
                    pattern,
                    subfields,
                    required,
                } => {
                    let pattern = pattern
                        .as_deref()
                        .map(Regex::new)
                        .transpose()
                        .map_err(|e| {
                            PipelineError::Config(format!("field '{}' has an invalid pattern: {}", name, e))
                        })?;
                    CompiledField::Nested {
                        name: name.clone(),
                        pattern,
                        subfields: subfields.clone(),
                        required: *required,
                    }
                }
                FieldSpec::Timestamp { name } => CompiledField::Timestamp { name: name.clone() },
                FieldSpec::Boolean { name } => CompiledField::Boolean { name: name.clone() },
            });
        }

        Ok(Self {
            entity_key_field: schema.entity_key.clone(),
            observed_at_field: schema.observed_at.clone(),
            fields,
            derived: schema.derived.clone(),
            vocabularies,
        })
    }

    fn normalize_fields(
        &self,
        raw: &Map<String, Value>,
        record_id: &str,
        source_id: &str,
        ingested_at: DateTime<Utc>,
        mut notes: FieldNotes,
    ) -> Result<NormalizedRecord> {
        let entity_key = raw
            .get(&self.entity_key_field)
            .and_then(entity_key_from_json)
            .ok_or_else(|| {
                PipelineError::normalization(&self.entity_key_field, "entity key is missing or empty")
            })?;

        let mut fields = BTreeMap::new();

        let observed_at = match raw.get(&self.observed_at_field).and_then(parse_timestamp) {
            Some(ts) => {
                fields.insert(self.observed_at_field.clone(), FieldValue::Timestamp(ts));
                ts
            }
            None => {
                fields.insert(self.observed_at_field.clone(), FieldValue::Null);
                notes.degraded.insert(self.observed_at_field.clone());
                notes.warn(format!(
                    "'{}' missing or unparseable; using ingestion time",
                    self.observed_at_field
                ));
                ingested_at
            }
        };

        for field in &self.fields {
            let (name, value) = self.normalize_field(field, raw, &mut notes)?;
            fields.insert(name, value);
        }

        for derived in &self.derived {
            let (value, warning) = derived.compute(&fields);
            if let Some(w) = warning {
                notes.warn(w);
            }
            fields.insert(derived.name().to_string(), value);
        }

        let content_hash = NormalizedRecord::compute_content_hash(&entity_key, &fields);
        Ok(NormalizedRecord {
            record_id: record_id.to_string(),
            entity_key,
            observed_at,
            ingested_at,
            source_id: source_id.to_string(),
            fields,
            content_hash,
            coerced: notes.coerced,
            degraded: notes.degraded,
            warnings: notes.warnings,
        })
    }

    fn normalize_field(
        &self,
        field: &CompiledField,
        raw: &Map<String, Value>,
        notes: &mut FieldNotes,
    ) -> Result<(String, FieldValue)> {
        match field {
            CompiledField::String { name, case } => {
                let value = match raw.get(name) {
                    Some(Value::String(s)) => text_or_null(clean_text(s, *case)),
                    Some(Value::Null) | None => FieldValue::Null,
                    Some(other) => text_or_null(clean_text(&other.to_string(), *case)),
                };
                Ok((name.clone(), value))
            }
            CompiledField::Numeric {
                name,
                min,
                max,
                out_of_range,
                integer,
            } => {
                let value = match raw.get(name) {
                    None | Some(Value::Null) => FieldValue::Null,
                    Some(v) => match parse_decorated_decimal(v) {
                        Ok(parsed) => {
                            if parsed.decorated {
                                notes.coerced.insert(name.clone());
                            }
                            let mut n = parsed.value;
                            if *integer && n.fract() != Decimal::ZERO {
                                n = n.trunc();
                                notes.coerced.insert(name.clone());
                            }
                            self.apply_bounds(name, n.normalize(), *min, *max, *out_of_range, notes)
                        }
                        Err(reason) => {
                            notes.coerced.insert(name.clone());
                            notes.warn(format!("'{}' nulled: {}", name, reason));
                            FieldValue::Null
                        }
                    },
                };
                Ok((name.clone(), value))
            }
            CompiledField::Categorical { name, vocabulary } => {
                let raw_label = match raw.get(name) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) if s.trim().is_empty() => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => Some(other.to_string()),
                };
                let value = match raw_label {
                    None => FieldValue::Null,
                    Some(label) => match self.vocabularies.classify(vocabulary, &label) {
                        VocabularyMatch::Known(canonical) => FieldValue::Text(canonical),
                        unclassified @ VocabularyMatch::Unclassified => {
                            notes.coerced.insert(name.clone());
                            FieldValue::Text(unclassified.label().to_string())
                        }
                    },
                };
                Ok((name.clone(), value))
            }
            CompiledField::Nested {
                name,
                pattern,
                subfields,
                required,
            } => {
                let parsed = match raw.get(name) {
                    None | Some(Value::Null) => Err("value is missing".to_string()),
                    Some(v) => parse_nested(v, pattern.as_ref(), subfields),
                };
                match parsed {
                    Ok(structured) => Ok((name.clone(), FieldValue::Struct(structured))),
                    Err(reason) if *required => Err(PipelineError::normalization(name, reason)),
                    Err(reason) => {
                        if raw.get(name).map_or(false, |v| !v.is_null()) {
                            notes.degraded.insert(name.clone());
                            notes.warn(format!("'{}' degraded to null: {}", name, reason));
                        }
                        Ok((name.clone(), FieldValue::Null))
                    }
                }
            }
            CompiledField::Timestamp { name } => {
                let value = match raw.get(name) {
                    None | Some(Value::Null) => FieldValue::Null,
                    Some(v) => match parse_timestamp(v) {
                        Some(ts) => FieldValue::Timestamp(ts),
                        None => {
                            notes.coerced.insert(name.clone());
                            notes.warn(format!("'{}' is not a timestamp", name));
                            FieldValue::Null
                        }
                    },
                };
                Ok((name.clone(), value))
            }
            CompiledField::Boolean { name } => {
                let value = match raw.get(name) {
                    None | Some(Value::Null) => FieldValue::Null,
                    Some(v) => match parse_bool(v) {
                        Some(b) => FieldValue::Bool(b),
                        None => {
                            notes.coerced.insert(name.clone());
                            FieldValue::Null
                        }
                    },
                };
                Ok((name.clone(), value))
            }
        }
    }

    fn apply_bounds(
        &self,
        name: &str,
        n: Decimal,
        min: Option<Decimal>,
        max: Option<Decimal>,
        policy: OutOfRange,
        notes: &mut FieldNotes,
    ) -> FieldValue {
        let below = min.map_or(false, |m| n < m);
        let above = max.map_or(false, |m| n > m);
        if !below && !above {
            return FieldValue::Number(n);
        }
        notes.coerced.insert(name.to_string());
        match policy {
            OutOfRange::Null => {
                notes.warn(format!("'{}' value {} outside plausible range; nulled", name, n));
                FieldValue::Null
            }
            OutOfRange::Clamp => {
                let clamped = match (below, min, max) {
                    (true, Some(m), _) => m,
                    (_, _, Some(m)) => m,
                    _ => n,
                };
                FieldValue::Number(clamped.normalize())
            }
        }
    }
}

impl Normalizer for SchemaNormalizer {
    fn normalize(&self, record: &RawRecord) -> Result<NormalizedRecord> {
        self.normalize_fields(
            &record.fields,
            &record.record_id,
            &record.meta.source_id,
            record.meta.ingested_at,
            FieldNotes::default(),
        )
    }

    fn renormalize(&self, record: &NormalizedRecord) -> Result<NormalizedRecord> {
        let mut raw = record.to_raw_fields();
        raw.insert(
            self.entity_key_field.clone(),
            Value::String(record.entity_key.as_str().to_string()),
        );
        let notes = FieldNotes {
            coerced: record.coerced.clone(),
            degraded: record.degraded.clone(),
            warnings: record.warnings.clone(),
        };
        self.normalize_fields(
            &raw,
            &record.record_id,
            &record.source_id,
            record.ingested_at,
            notes,
        )
    }
}

/// Trim, collapse internal whitespace and apply the casing style
pub fn clean_text(raw: &str, case: CaseStyle) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    match case {
        CaseStyle::Lower => collapsed.to_lowercase(),
        CaseStyle::Upper => collapsed.to_uppercase(),
        CaseStyle::Preserve => collapsed,
        CaseStyle::Title => collapsed
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" "),
    }
}

fn text_or_null(s: String) -> FieldValue {
    if s.is_empty() {
        FieldValue::Null
    } else {
        FieldValue::Text(s)
    }
}

fn entity_key_from_json(value: &Value) -> Option<EntityKey> {
    let key = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if key.is_empty() {
        None
    } else {
        Some(EntityKey(key))
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` (midnight UTC) and unix seconds
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_nested(
    value: &Value,
    pattern: Option<&Regex>,
    subfields: &[SubfieldSpec],
) -> std::result::Result<BTreeMap<String, FieldValue>, String> {
    let object = match value {
        Value::Object(map) => map.clone(),
        Value::String(s) if s.trim_start().starts_with('{') => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => return Err("embedded JSON is malformed".to_string()),
        },
        Value::String(s) => {
            let re = pattern.ok_or_else(|| "no pattern configured for string value".to_string())?;
            let caps = re
                .captures(s.trim())
                .ok_or_else(|| format!("'{}' does not match the expected layout", s))?;
            subfields
                .iter()
                .filter_map(|sub| {
                    caps.name(&sub.name)
                        .map(|m| (sub.name.clone(), Value::String(m.as_str().to_string())))
                })
                .collect()
        }
        _ => return Err("expected an object or string".to_string()),
    };

    let mut structured = BTreeMap::new();
    let mut found = 0usize;
    for sub in subfields {
        let value = match (object.get(&sub.name), sub.kind) {
            (None, _) | (Some(Value::Null), _) => FieldValue::Null,
            (Some(v), SubfieldKind::Numeric) => match parse_decorated_decimal(v) {
                Ok(parsed) => FieldValue::Number(parsed.value),
                Err(reason) => return Err(format!("subfield '{}': {}", sub.name, reason)),
            },
            (Some(Value::String(s)), SubfieldKind::String) => text_or_null(clean_text(s, CaseStyle::Preserve)),
            (Some(other), SubfieldKind::String) => text_or_null(other.to_string()),
        };
        if !value.is_null() {
            found += 1;
        }
        structured.insert(sub.name.clone(), value);
    }
    if found == 0 {
        return Err("no subfields could be extracted".to_string());
    }
    Ok(structured)
}

/// Months represented by a nested `{years, months}` credit-history structure, if present
pub fn total_months(value: &FieldValue) -> Option<i64> {
    let FieldValue::Struct(parts) = value else {
        return None;
    };
    let years = parts.get("years").and_then(FieldValue::as_decimal).unwrap_or_default();
    let months = parts.get("months").and_then(FieldValue::as_decimal).unwrap_or_default();
    (years * Decimal::from(12) + months).to_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IngestMetadata;
    use serde_json::json;

    fn schema() -> SchemaConfig {
        toml::from_str(
            r#"
            entity_key = "customer_id"
            observed_at = "observed_at"

            [[fields]]
            kind = "string"
            name = "name"
            case = "title"

            [[fields]]
            kind = "numeric"
            name = "annual_income"
            min = 0

            [[fields]]
            kind = "numeric"
            name = "age"
            min = 14
            max = 100
            out_of_range = "clamp"
            integer = true

            [[fields]]
            kind = "categorical"
            name = "occupation"
            vocabulary = "occupation"

            [[fields]]
            kind = "nested"
            name = "credit_history_age"
            pattern = '^(?P<years>\d+) Years and (?P<months>\d+) Months$'
            subfields = [{ name = "years" }, { name = "months" }]
            "#,
        )
        .unwrap()
    }

    fn normalizer() -> SchemaNormalizer {
        let mut aliases = BTreeMap::new();
        aliases.insert("software engineer".to_string(), "Engineer".to_string());
        let mut tables = BTreeMap::new();
        tables.insert("occupation".to_string(), aliases);
        SchemaNormalizer::from_config(&schema(), Arc::new(Vocabularies::from_tables(&tables))).unwrap()
    }

    fn raw(fields: Value) -> RawRecord {
        let Value::Object(map) = fields else { panic!("object expected") };
        RawRecord::new(
            map,
            IngestMetadata {
                source_id: "core".into(),
                ingested_at: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
                source_partition: "p0".into(),
                offset: 1,
            },
        )
    }

    #[test]
    fn cleans_strings_numbers_and_categories() {
        let rec = normalizer()
            .normalize(&raw(json!({
                "customer_id": " C1 ",
                "observed_at": "2024-01-05",
                "name": "  aaron   MAASHOH ",
                "annual_income": "$52,000.00",
                "age": "23_",
                "occupation": "software  engineer",
                "credit_history_age": "22 Years and 1 Months"
            })))
            .unwrap();

        assert_eq!(rec.entity_key, EntityKey::new("C1"));
        assert_eq!(rec.field("name"), &FieldValue::Text("Aaron Maashoh".into()));
        assert_eq!(rec.field("annual_income"), &FieldValue::Number(Decimal::from(52000)));
        assert_eq!(rec.field("age"), &FieldValue::Number(Decimal::from(23)));
        assert_eq!(rec.field("occupation"), &FieldValue::Text("Engineer".into()));
        assert_eq!(total_months(rec.field("credit_history_age")), Some(22 * 12 + 1));
        assert!(rec.coerced.contains("annual_income"));
        assert!(rec.coerced.contains("age"));
    }

    #[test]
    fn negative_income_is_nulled_and_flagged() {
        let rec = normalizer()
            .normalize(&raw(json!({
                "customer_id": "C1",
                "observed_at": "2024-01-05",
                "annual_income": "-999"
            })))
            .unwrap();
        assert!(rec.field("annual_income").is_null());
        assert!(rec.coerced.contains("annual_income"));
    }

    #[test]
    fn clamps_when_configured() {
        let rec = normalizer()
            .normalize(&raw(json!({"customer_id": "C1", "observed_at": "2024-01-05", "age": 7000})))
            .unwrap();
        assert_eq!(rec.field("age"), &FieldValue::Number(Decimal::from(100)));
    }

    #[test]
    fn unknown_category_is_unclassified_not_dropped() {
        let rec = normalizer()
            .normalize(&raw(json!({"customer_id": "C1", "observed_at": "2024-01-05", "occupation": "_______"})))
            .unwrap();
        assert_eq!(
            rec.field("occupation"),
            &FieldValue::Text(crate::constants::UNCLASSIFIED_LABEL.into())
        );
    }

    #[test]
    fn nested_parse_failure_degrades_field_only() {
        let rec = normalizer()
            .normalize(&raw(json!({
                "customer_id": "C1",
                "observed_at": "2024-01-05",
                "annual_income": 1000,
                "credit_history_age": "NA"
            })))
            .unwrap();
        assert!(rec.field("credit_history_age").is_null());
        assert!(rec.degraded.contains("credit_history_age"));
        assert_eq!(rec.field("annual_income"), &FieldValue::Number(Decimal::from(1000)));
    }

    #[test]
    fn required_nested_failure_fails_record() {
        let mut schema = schema();
        for f in schema.fields.iter_mut() {
            if let FieldSpec::Nested { required, .. } = f {
                *required = true;
            }
        }
        let mut aliases = BTreeMap::new();
        aliases.insert("x".to_string(), "X".to_string());
        let mut tables = BTreeMap::new();
        tables.insert("occupation".to_string(), aliases);
        let n = SchemaNormalizer::from_config(&schema, Arc::new(Vocabularies::from_tables(&tables))).unwrap();
        let err = n
            .normalize(&raw(json!({"customer_id": "C1", "observed_at": "2024-01-05", "credit_history_age": "??"})))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Normalization { .. }));
    }

    #[test]
    fn missing_entity_key_fails() {
        let err = normalizer()
            .normalize(&raw(json!({"customer_id": "  ", "observed_at": "2024-01-05"})))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Normalization { .. }));
    }

    #[test]
    fn renormalizing_is_idempotent() {
        let n = normalizer();
        let inputs = [
            json!({
                "customer_id": "C1",
                "observed_at": "2024-01-05T10:00:00Z",
                "name": "  jane   doe",
                "annual_income": "-999",
                "age": "7000",
                "occupation": "_______",
                "credit_history_age": "22 Years and 1 Months"
            }),
            json!({"customer_id": 42, "annual_income": "12,500.50", "credit_history_age": "garbage"}),
        ];
        for input in inputs {
            let once = n.normalize(&raw(input)).unwrap();
            let twice = n.renormalize(&once).unwrap();
            assert_eq!(once, twice);
            assert_eq!(n.renormalize(&twice).unwrap(), twice);
        }
    }

    #[test]
    fn missing_observation_time_falls_back_to_ingestion() {
        let rec = normalizer()
            .normalize(&raw(json!({"customer_id": "C1"})))
            .unwrap();
        assert_eq!(rec.observed_at, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert!(rec.degraded.contains("observed_at"));
    }
}
