//! Data shapes shared by every tier of the pipeline.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::idempotency::{compute_content_hash, compute_record_id};

/// Where and when a raw record entered the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestMetadata {
    pub source_id: String,
    pub ingested_at: DateTime<Utc>,
    pub source_partition: String,
    /// Position of the record within its source (line number, sequence number, ...)
    pub offset: u64,
}

/// An immutable record as handed over by an ingestion adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub record_id: String,
    pub fields: Map<String, Value>,
    pub meta: IngestMetadata,
}

impl RawRecord {
    pub fn new(fields: Map<String, Value>, meta: IngestMetadata) -> Self {
        // serde_json::Map is ordered by key without the preserve_order feature
        let canonical = Value::Object(fields.clone()).to_string();
        let record_id =
            compute_record_id(&meta.source_id, &meta.source_partition, meta.offset, &canonical);
        Self {
            record_id,
            fields,
            meta,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Stable identifier grouping all observations of one real-world entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(pub String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        EntityKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed, normalized field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Number(Decimal),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Struct(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Render back into the raw JSON shape the normalizer accepts. Numbers stay strings so
    /// that re-normalizing never goes through a lossy float.
    pub fn to_raw_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Number(d) => Value::String(d.to_string()),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Timestamp(ts) => {
                Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            FieldValue::Struct(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_raw_json()))
                    .collect(),
            ),
        }
    }

    /// Render for analytics output tables, where numbers are JSON numbers
    pub fn to_output_json(&self) -> Value {
        match self {
            FieldValue::Number(d) => decimal_to_json(*d),
            FieldValue::Struct(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_output_json()))
                    .collect(),
            ),
            other => other.to_raw_json(),
        }
    }

    /// Label used when this value is a grouping key
    pub fn group_label(&self) -> String {
        match self {
            FieldValue::Null => crate::constants::NULL_GROUP_LABEL.to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(d) => d.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            FieldValue::Struct(_) => self.to_raw_json().to_string(),
        }
    }
}

pub fn decimal_to_json(d: Decimal) -> Value {
    serde_json::Number::from_str(&d.normalize().to_string())
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(d.to_string()))
}

/// A record after cleansing and normalization, still carrying its lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub record_id: String,
    pub entity_key: EntityKey,
    pub observed_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub source_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Hash over entity key and field content; equal hashes mean identical observations
    pub content_hash: String,
    /// Fields whose raw value was coerced (decoration stripped, nulled or clamped)
    pub coerced: BTreeSet<String>,
    /// Nested fields that failed to parse and were degraded to null
    pub degraded: BTreeSet<String>,
    pub warnings: Vec<String>,
}

impl NormalizedRecord {
    pub fn field(&self, name: &str) -> &FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn compute_content_hash(entity_key: &EntityKey, fields: &BTreeMap<String, FieldValue>) -> String {
        // BTreeMap serialization is key-ordered, so the JSON is canonical
        let canonical = serde_json::to_string(fields).unwrap_or_default();
        compute_content_hash(entity_key.as_str(), &canonical)
    }

    /// The raw JSON shape of this record, suitable for feeding back into the normalizer
    pub fn to_raw_fields(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_raw_json()))
            .collect()
    }
}

/// One retained observation in an entity's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub observed_at: DateTime<Utc>,
    pub content_hash: String,
    pub record: NormalizedRecord,
}

impl HistoryEntry {
    pub fn from_record(record: NormalizedRecord) -> Self {
        Self {
            observed_at: record.observed_at,
            content_hash: record.content_hash.clone(),
            record,
        }
    }
}

/// The authoritative current view of an entity plus its ordered observation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub entity_key: EntityKey,
    pub current: NormalizedRecord,
    /// Ordered by observation timestamp ascending, append-only
    pub history: Vec<HistoryEntry>,
}
