use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Per-record rule failure. Routed by the Quality Gate, never fatal to a run.
    #[error("Validation failed for record {record_id}: {reason}")]
    Validation { record_id: String, reason: String },

    /// Per-field failure. Degrades the field unless it is required.
    #[error("Normalization failed on field '{field}': {reason}")]
    Normalization { field: String, reason: String },

    #[error("Deduplication conflict for entity {entity_key}: {detail}")]
    DeduplicationConflict { entity_key: String, detail: String },

    #[error("Aggregation failed for product '{product}': {reason}")]
    Aggregation { product: String, reason: String },

    #[error("Ingestion failed for source '{source_id}': {reason}")]
    Ingestion { source_id: String, reason: String },

    #[error("Source '{source_id}' stalled after {attempts} attempts: {last_error}")]
    SourceStalled {
        source_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn aggregation(product: &str, reason: impl Into<String>) -> Self {
        PipelineError::Aggregation {
            product: product.to_string(),
            reason: reason.into(),
        }
    }

    pub fn normalization(field: &str, reason: impl Into<String>) -> Self {
        PipelineError::Normalization {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn ingestion(source_id: &str, reason: impl Into<String>) -> Self {
        PipelineError::Ingestion {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
