//! Tier stores: the raw log, verdicts and quarantine, the canonical tier, window state,
//! analytics products and streaming checkpoints.

pub mod in_memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::domain::{CanonicalRecord, EntityKey, RawRecord};
use crate::error::Result;
use crate::pipeline::processing::aggregate::{ProductTable, WindowState};
use crate::pipeline::processing::quality_gate::ValidationVerdict;

pub use in_memory::InMemoryTierStore;
pub use sqlite::SqliteTierStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuarantineStatus {
    Held,
    /// Re-validated under the current rules and let through
    Released,
    /// Superseded by a corrected record
    Resubmitted { replacement_id: String },
}

/// A record held back by the Quality Gate, awaiting remediation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub record: RawRecord,
    pub failures: Vec<String>,
    pub rule_version: String,
    pub status: QuarantineStatus,
    pub quarantined_at: DateTime<Utc>,
}

/// Last committed position of a streaming source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub offset: u64,
    pub run_id: String,
    pub committed_at: DateTime<Utc>,
}

/// Everything a micro-batch makes visible, applied atomically
#[derive(Debug, Clone, Default)]
pub struct BatchCommit {
    pub run_id: String,
    pub checkpoint: Option<Checkpoint>,
    pub canonical: Vec<CanonicalRecord>,
    pub window_states: Vec<(String, WindowState)>,
    pub products: Vec<ProductTable>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReceipt {
    /// Version assigned to each product table written by the commit
    pub product_versions: BTreeMap<String, u64>,
}

/// Storage port for all three tiers. Raw, verdict and quarantine writes are keyed and
/// idempotent; everything a micro-batch derives goes through one atomic [`TierStore::commit`].
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Append to the raw log, ignoring ids already present. Returns how many were new.
    async fn append_raw(&self, records: &[RawRecord]) -> Result<usize>;
    async fn raw_record(&self, record_id: &str) -> Result<Option<RawRecord>>;

    /// Stored copies of the given ids; ids not yet in the raw log are absent from the map
    async fn raw_records(&self, record_ids: &[String]) -> Result<HashMap<String, RawRecord>> {
        let mut found = HashMap::with_capacity(record_ids.len());
        for id in record_ids {
            if let Some(record) = self.raw_record(id).await? {
                found.insert(id.clone(), record);
            }
        }
        Ok(found)
    }

    async fn record_verdicts(&self, verdicts: &[ValidationVerdict]) -> Result<()>;
    async fn verdicts_for(&self, record_id: &str) -> Result<Vec<ValidationVerdict>>;

    /// Hold records in quarantine; entries already held are left as they are
    async fn quarantine(&self, entries: &[QuarantineEntry]) -> Result<()>;
    async fn list_quarantine(&self) -> Result<Vec<QuarantineEntry>>;
    async fn quarantine_entry(&self, record_id: &str) -> Result<Option<QuarantineEntry>>;
    async fn set_quarantine_status(&self, record_id: &str, status: QuarantineStatus) -> Result<()>;

    async fn load_canonical(&self, keys: &[EntityKey]) -> Result<HashMap<EntityKey, CanonicalRecord>>;
    async fn canonical_snapshot(&self) -> Result<BTreeMap<EntityKey, CanonicalRecord>>;

    async fn window_states(&self) -> Result<HashMap<String, WindowState>>;

    async fn latest_product(&self, name: &str) -> Result<Option<ProductTable>>;
    /// Every stored version of a product, oldest first
    async fn product_versions(&self, name: &str) -> Result<Vec<ProductTable>>;
    async fn product_names(&self) -> Result<Vec<String>>;

    async fn checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>>;

    async fn commit(&self, commit: BatchCommit) -> Result<CommitReceipt>;
}
