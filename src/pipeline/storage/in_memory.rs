use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{BatchCommit, Checkpoint, CommitReceipt, QuarantineEntry, QuarantineStatus, TierStore};
use crate::domain::{CanonicalRecord, EntityKey, RawRecord};
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::aggregate::{ProductTable, WindowState};
use crate::pipeline::processing::quality_gate::ValidationVerdict;

#[derive(Default)]
struct Tiers {
    raw: BTreeMap<String, RawRecord>,
    verdicts: BTreeMap<(String, String, String), ValidationVerdict>,
    quarantine: BTreeMap<String, QuarantineEntry>,
    canonical: BTreeMap<EntityKey, CanonicalRecord>,
    window_states: HashMap<String, WindowState>,
    products: BTreeMap<String, Vec<ProductTable>>,
    checkpoints: HashMap<String, Checkpoint>,
}

/// In-memory tier store for development and tests. One lock guards every tier, so a commit
/// is atomic with respect to readers.
#[derive(Default)]
pub struct InMemoryTierStore {
    tiers: Mutex<Tiers>,
}

impl InMemoryTierStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tiers>> {
        self.tiers
            .lock()
            .map_err(|e| PipelineError::Store(format!("in-memory store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl TierStore for InMemoryTierStore {
    async fn append_raw(&self, records: &[RawRecord]) -> Result<usize> {
        let mut tiers = self.lock()?;
        let mut inserted = 0;
        for record in records {
            if !tiers.raw.contains_key(&record.record_id) {
                tiers.raw.insert(record.record_id.clone(), record.clone());
                inserted += 1;
            }
        }
        debug!("Appended {} of {} raw records", inserted, records.len());
        Ok(inserted)
    }

    async fn raw_record(&self, record_id: &str) -> Result<Option<RawRecord>> {
        Ok(self.lock()?.raw.get(record_id).cloned())
    }

    async fn record_verdicts(&self, verdicts: &[ValidationVerdict]) -> Result<()> {
        let mut tiers = self.lock()?;
        for v in verdicts {
            tiers
                .verdicts
                .entry((v.record_id.clone(), v.rule_name.clone(), v.rule_version.clone()))
                .or_insert_with(|| v.clone());
        }
        Ok(())
    }

    async fn verdicts_for(&self, record_id: &str) -> Result<Vec<ValidationVerdict>> {
        Ok(self
            .lock()?
            .verdicts
            .values()
            .filter(|v| v.record_id == record_id)
            .cloned()
            .collect())
    }

    async fn quarantine(&self, entries: &[QuarantineEntry]) -> Result<()> {
        let mut tiers = self.lock()?;
        for entry in entries {
            tiers
                .quarantine
                .entry(entry.record.record_id.clone())
                .or_insert_with(|| entry.clone());
        }
        Ok(())
    }

    async fn list_quarantine(&self) -> Result<Vec<QuarantineEntry>> {
        Ok(self.lock()?.quarantine.values().cloned().collect())
    }

    async fn quarantine_entry(&self, record_id: &str) -> Result<Option<QuarantineEntry>> {
        Ok(self.lock()?.quarantine.get(record_id).cloned())
    }

    async fn set_quarantine_status(&self, record_id: &str, status: QuarantineStatus) -> Result<()> {
        let mut tiers = self.lock()?;
        let entry = tiers
            .quarantine
            .get_mut(record_id)
            .ok_or_else(|| PipelineError::Store(format!("record {} is not in quarantine", record_id)))?;
        entry.status = status;
        Ok(())
    }

    async fn load_canonical(&self, keys: &[EntityKey]) -> Result<HashMap<EntityKey, CanonicalRecord>> {
        let tiers = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|k| tiers.canonical.get(k).map(|c| (k.clone(), c.clone())))
            .collect())
    }

    async fn canonical_snapshot(&self) -> Result<BTreeMap<EntityKey, CanonicalRecord>> {
        Ok(self.lock()?.canonical.clone())
    }

    async fn window_states(&self) -> Result<HashMap<String, WindowState>> {
        Ok(self.lock()?.window_states.clone())
    }

    async fn latest_product(&self, name: &str) -> Result<Option<ProductTable>> {
        Ok(self
            .lock()?
            .products
            .get(name)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn product_versions(&self, name: &str) -> Result<Vec<ProductTable>> {
        Ok(self.lock()?.products.get(name).cloned().unwrap_or_default())
    }

    async fn product_names(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.products.keys().cloned().collect())
    }

    async fn checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lock()?.checkpoints.get(source_id).cloned())
    }

    async fn commit(&self, commit: BatchCommit) -> Result<CommitReceipt> {
        let mut tiers = self.lock()?;
        let mut receipt = CommitReceipt::default();

        for record in commit.canonical {
            tiers.canonical.insert(record.entity_key.clone(), record);
        }
        for (product, state) in commit.window_states {
            tiers.window_states.insert(product, state);
        }
        for mut table in commit.products {
            let versions = tiers.products.entry(table.product.clone()).or_default();
            table.version = versions.last().map_or(1, |t| t.version + 1);
            receipt.product_versions.insert(table.product.clone(), table.version);
            versions.push(table);
        }
        if let Some(checkpoint) = commit.checkpoint {
            tiers.checkpoints.insert(checkpoint.source_id.clone(), checkpoint);
        }

        debug!("Committed run {} ({} products)", commit.run_id, receipt.product_versions.len());
        Ok(receipt)
    }
}
