//! Quarantine remediation and verdict lookup.
//!
//! Quarantined records stay out of the canonical tier until they either pass the
//! current rule set on re-validation or are superseded by a corrected resubmission.

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::RunContext;
use crate::constants::REMEDIATION_PARTITION;
use crate::domain::{IngestMetadata, RawRecord};
use crate::error::{PipelineError, Result};
use crate::metrics::QualityGateMetrics;
use crate::pipeline::processing::quality_gate::ValidationVerdict;
use crate::pipeline::runner::{process_records, RunReport};
use crate::pipeline::storage::{QuarantineEntry, QuarantineStatus, TierStore};

#[derive(Debug)]
pub enum Revalidation {
    /// Passed the current rules and was merged downstream
    Released(RunReport),
    /// Still fails; the record stays held
    StillHeld { failures: Vec<String> },
}

#[derive(Debug)]
pub struct Resubmission {
    pub replacement_id: String,
    pub report: RunReport,
}

pub struct Auditor<'a> {
    ctx: &'a RunContext,
    store: &'a dyn TierStore,
}

impl<'a> Auditor<'a> {
    pub fn new(ctx: &'a RunContext, store: &'a dyn TierStore) -> Self {
        Self { ctx, store }
    }

    pub async fn list_quarantine(&self) -> Result<Vec<QuarantineEntry>> {
        self.store.list_quarantine().await
    }

    /// Entries still waiting for remediation
    pub async fn held(&self) -> Result<Vec<QuarantineEntry>> {
        Ok(self
            .store
            .list_quarantine()
            .await?
            .into_iter()
            .filter(|e| e.status == QuarantineStatus::Held)
            .collect())
    }

    pub async fn verdicts_for(&self, record_id: &str) -> Result<Vec<ValidationVerdict>> {
        self.store.verdicts_for(record_id).await
    }

    /// Re-run a held record through the current rule set and release it if it now passes
    pub async fn revalidate(&self, record_id: &str) -> Result<Revalidation> {
        let entry = self.held_entry(record_id).await?;

        let assessment = self.ctx.gate.assess(&entry.record);
        if !assessment.decision.proceeds() {
            self.store.record_verdicts(&assessment.verdicts).await?;
            let failures = assessment
                .failures()
                .map(|v| format!("{}: {}", v.rule_name, v.reason.as_deref().unwrap_or("failed")))
                .collect();
            return Ok(Revalidation::StillHeld { failures });
        }

        let mut report = RunReport::new(&self.ctx.run_id);
        process_records(self.ctx, self.store, std::slice::from_ref(&entry.record), None, &mut report).await?;
        self.store
            .set_quarantine_status(record_id, QuarantineStatus::Released)
            .await?;
        QualityGateMetrics::record_released();
        info!(record_id, rule_version = %self.ctx.rule_version(), "quarantined record released");
        Ok(Revalidation::Released(report))
    }

    /// Replace a held record with corrected fields. The replacement is a new raw record in
    /// the remediation partition and goes through the full chain, gate included.
    pub async fn resubmit(&self, record_id: &str, fields: Map<String, Value>) -> Result<Resubmission> {
        let entry = self.held_entry(record_id).await?;

        let replacement = RawRecord::new(
            fields,
            IngestMetadata {
                source_id: entry.record.meta.source_id.clone(),
                ingested_at: Utc::now(),
                source_partition: REMEDIATION_PARTITION.to_string(),
                offset: entry.record.meta.offset,
            },
        );
        let replacement_id = replacement.record_id.clone();

        let mut report = RunReport::new(&self.ctx.run_id);
        report.received = 1;
        report.raw_appended = self.store.append_raw(std::slice::from_ref(&replacement)).await?;
        process_records(self.ctx, self.store, std::slice::from_ref(&replacement), None, &mut report).await?;

        self.store
            .set_quarantine_status(
                record_id,
                QuarantineStatus::Resubmitted {
                    replacement_id: replacement_id.clone(),
                },
            )
            .await?;
        QualityGateMetrics::record_resubmitted();
        info!(record_id, %replacement_id, "quarantined record resubmitted");
        Ok(Resubmission { replacement_id, report })
    }

    async fn held_entry(&self, record_id: &str) -> Result<QuarantineEntry> {
        let entry = self
            .store
            .quarantine_entry(record_id)
            .await?
            .ok_or_else(|| PipelineError::Validation {
                record_id: record_id.to_string(),
                reason: "record is not in quarantine".to_string(),
            })?;
        if entry.status != QuarantineStatus::Held {
            return Err(PipelineError::Validation {
                record_id: record_id.to_string(),
                reason: "quarantined record was already remediated".to_string(),
            });
        }
        Ok(entry)
    }
}
