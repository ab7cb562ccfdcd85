//! Drives records through the whole chain: raw log, Quality Gate, normalization,
//! deduplication, aggregation, then one atomic commit of everything the batch derived.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::config::RunContext;
use crate::constants::NORMALIZE_RULE_PREFIX;
use crate::domain::{EntityKey, NormalizedRecord, RawRecord};
use crate::error::{PipelineError, Result};
use crate::metrics::{AggregationMetrics, CanonicalMetrics, IngestionMetrics, QualityGateMetrics};
use crate::pipeline::ingestion::{IngestBatch, IngestionAdapter};
use crate::pipeline::processing::aggregate::AggregationInput;
use crate::pipeline::processing::quality_gate::{QualityDecision, ValidationVerdict, VerdictOutcome};
use crate::pipeline::storage::{BatchCommit, Checkpoint, QuarantineEntry, QuarantineStatus, TierStore};

/// State of the source at the end of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    Completed,
    /// Stopped by a shutdown signal between micro-batches
    Cancelled,
    Stalled { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductFailure {
    pub product: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupConflict {
    pub entity_key: String,
    pub detail: String,
}

/// Per-stage counts for a run (or the sum of a stream's micro-batches)
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub batches: usize,
    pub received: usize,
    pub malformed: usize,
    pub raw_appended: usize,
    pub accepted: usize,
    pub warned: usize,
    pub quarantined: usize,
    pub rejected: usize,
    pub normalized: usize,
    pub degraded_fields: usize,
    pub normalization_failed: usize,
    pub entities_updated: usize,
    pub duplicates_collapsed: usize,
    pub dedup_conflicts: Vec<DedupConflict>,
    pub products_succeeded: Vec<String>,
    pub products_failed: Vec<ProductFailure>,
    pub late_observations: usize,
    /// Queued observations of failed windowed runs that were set aside for failing again
    pub observations_set_aside: usize,
    /// Latest committed version of each product written during the run
    pub product_versions: BTreeMap<String, u64>,
    pub last_offset: Option<u64>,
    pub source_status: SourceStatus,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    /// Fold a micro-batch report into a running total
    pub fn absorb(&mut self, batch: RunReport) {
        self.batches += batch.batches;
        self.received += batch.received;
        self.malformed += batch.malformed;
        self.raw_appended += batch.raw_appended;
        self.accepted += batch.accepted;
        self.warned += batch.warned;
        self.quarantined += batch.quarantined;
        self.rejected += batch.rejected;
        self.normalized += batch.normalized;
        self.degraded_fields += batch.degraded_fields;
        self.normalization_failed += batch.normalization_failed;
        self.entities_updated += batch.entities_updated;
        self.duplicates_collapsed += batch.duplicates_collapsed;
        self.dedup_conflicts.extend(batch.dedup_conflicts);
        for product in batch.products_succeeded {
            if !self.products_succeeded.contains(&product) {
                self.products_succeeded.push(product);
            }
        }
        self.products_failed.extend(batch.products_failed);
        self.late_observations += batch.late_observations;
        self.observations_set_aside += batch.observations_set_aside;
        self.product_versions.extend(batch.product_versions);
        if batch.last_offset.is_some() {
            self.last_offset = batch.last_offset;
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.products_failed.is_empty()
            || !self.dedup_conflicts.is_empty()
            || self.source_status != SourceStatus::Completed
    }
}

/// Process one micro-batch end to end. When `checkpoint_offset` is given the source
/// checkpoint is committed in the same transaction as the derived tiers.
pub async fn process_batch(
    ctx: &RunContext,
    store: &dyn TierStore,
    batch: &IngestBatch,
    checkpoint_offset: Option<u64>,
) -> Result<RunReport> {
    let span = tracing::info_span!(
        "micro_batch",
        run_id = %ctx.run_id,
        source = %batch.source_id,
        records = batch.records.len(),
        end_offset = batch.end_offset
    );
    async move {
        let mut report = RunReport::new(&ctx.run_id);
        report.batches = 1;
        report.received = batch.records.len() + batch.malformed;
        report.malformed = batch.malformed;
        IngestionMetrics::record_batch_read(&batch.source_id, batch.records.len(), batch.malformed);

        let ids: Vec<String> = batch.records.iter().map(|r| r.record_id.clone()).collect();
        let stored = store.raw_records(&ids).await?;
        report.raw_appended = store.append_raw(&batch.records).await?;
        IngestionMetrics::record_raw_append(report.raw_appended, batch.records.len());

        // a replayed record carries a fresh ingestion time; the raw log's copy is the one of record
        let records: Vec<RawRecord> = batch
            .records
            .iter()
            .map(|r| stored.get(&r.record_id).cloned().unwrap_or_else(|| r.clone()))
            .collect();

        let checkpoint = checkpoint_offset.map(|offset| Checkpoint {
            source_id: batch.source_id.clone(),
            offset,
            run_id: ctx.run_id.clone(),
            committed_at: Utc::now(),
        });
        process_records(ctx, store, &records, checkpoint, &mut report).await?;
        report.last_offset = checkpoint_offset;

        info!(
            accepted = report.accepted,
            warned = report.warned,
            quarantined = report.quarantined,
            rejected = report.rejected,
            entities_updated = report.entities_updated,
            products_failed = report.products_failed.len(),
            "micro-batch committed"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

/// Bounded batch mode: drain the adapter, then run everything as one unit with the
/// canonical resolution spread over `pipeline.workers` shards.
pub async fn run_batch(
    ctx: &RunContext,
    store: &dyn TierStore,
    adapter: &mut dyn IngestionAdapter,
) -> Result<RunReport> {
    let mut combined = IngestBatch {
        source_id: adapter.source_id().to_string(),
        ..Default::default()
    };
    while let Some(batch) = adapter.next_batch().await? {
        combined.records.extend(batch.records);
        combined.malformed += batch.malformed;
        combined.end_offset = batch.end_offset;
    }
    info!(
        run_id = %ctx.run_id,
        source = %combined.source_id,
        records = combined.records.len(),
        "starting batch run"
    );
    process_batch(ctx, store, &combined, None).await
}

/// Gate, normalize, resolve and aggregate records that are already in the raw log
pub(crate) async fn process_records(
    ctx: &RunContext,
    store: &dyn TierStore,
    records: &[RawRecord],
    checkpoint: Option<Checkpoint>,
    report: &mut RunReport,
) -> Result<()> {
    let mut verdicts: Vec<ValidationVerdict> = Vec::new();
    let mut held: Vec<QuarantineEntry> = Vec::new();
    let mut admitted: Vec<&RawRecord> = Vec::new();

    for record in records {
        let assessment = ctx.gate.assess(record);
        QualityGateMetrics::record_decision(assessment.decision);
        match assessment.decision {
            QualityDecision::Accept => {
                report.accepted += 1;
                admitted.push(record);
            }
            QualityDecision::AcceptWithWarnings => {
                report.warned += 1;
                debug!(record_id = %record.record_id, warnings = %assessment.failure_summary(), "accepted with warnings");
                admitted.push(record);
            }
            QualityDecision::Quarantine => {
                report.quarantined += 1;
                held.push(QuarantineEntry {
                    record: record.clone(),
                    failures: assessment.failures().map(describe_failure).collect(),
                    rule_version: ctx.rule_version().to_string(),
                    status: QuarantineStatus::Held,
                    quarantined_at: Utc::now(),
                });
            }
            QualityDecision::Reject => {
                report.rejected += 1;
                warn!(record_id = %record.record_id, reasons = %assessment.failure_summary(), "record rejected");
            }
        }
        verdicts.extend(assessment.verdicts);
    }

    let mut normalized: Vec<NormalizedRecord> = Vec::with_capacity(admitted.len());
    for record in admitted {
        match ctx.normalizer.normalize(record) {
            Ok(n) => {
                CanonicalMetrics::record_normalized(n.degraded.len());
                report.normalized += 1;
                report.degraded_fields += n.degraded.len();
                normalized.push(n);
            }
            Err(e) => {
                CanonicalMetrics::record_normalize_failure();
                report.normalization_failed += 1;
                report.rejected += 1;
                warn!(record_id = %record.record_id, error = %e, "normalization failed, record rejected");
                verdicts.push(normalization_verdict(ctx, record, &e));
            }
        }
    }

    store.record_verdicts(&verdicts).await?;
    store.quarantine(&held).await?;

    let mut commit = BatchCommit {
        run_id: ctx.run_id.clone(),
        checkpoint,
        ..Default::default()
    };

    let new_observations = resolve_canonical(ctx, store, normalized, &mut commit, report).await?;

    if !commit.canonical.is_empty() && !ctx.aggregation.products().is_empty() {
        aggregate(ctx, store, &new_observations, &mut commit, report).await?;
    } else {
        debug!("canonical tier unchanged, products not recomputed");
    }

    let receipt = store.commit(commit).await?;
    report.product_versions.extend(receipt.product_versions);
    Ok(())
}

fn describe_failure(verdict: &ValidationVerdict) -> String {
    match &verdict.reason {
        Some(reason) => format!("{}: {}", verdict.rule_name, reason),
        None => verdict.rule_name.clone(),
    }
}

fn normalization_verdict(ctx: &RunContext, record: &RawRecord, error: &PipelineError) -> ValidationVerdict {
    let field = match error {
        PipelineError::Normalization { field, .. } => field.as_str(),
        _ => "record",
    };
    ValidationVerdict {
        record_id: record.record_id.clone(),
        rule_name: format!("{}{}", NORMALIZE_RULE_PREFIX, field),
        rule_version: ctx.rule_version().to_string(),
        outcome: VerdictOutcome::Reject,
        reason: Some(error.to_string()),
        evaluated_at: Utc::now(),
    }
}

/// Merge normalized records into the canonical tier. Returns the observations that are
/// new to history, which feed incremental windowed products.
async fn resolve_canonical(
    ctx: &RunContext,
    store: &dyn TierStore,
    normalized: Vec<NormalizedRecord>,
    commit: &mut BatchCommit,
    report: &mut RunReport,
) -> Result<Vec<NormalizedRecord>> {
    if normalized.is_empty() {
        return Ok(Vec::new());
    }
    let started = Instant::now();

    let mut groups: BTreeMap<EntityKey, Vec<NormalizedRecord>> = BTreeMap::new();
    for record in normalized {
        groups.entry(record.entity_key.clone()).or_default().push(record);
    }
    let keys: Vec<EntityKey> = groups.keys().cloned().collect();
    let prior = store.load_canonical(&keys).await?;

    let mut new_observations = Vec::new();
    let mut collapsed = 0;
    let mut updated = 0;
    let mut conflicts = 0;
    for (key, outcome) in ctx.dedup.resolve_sharded(groups, &prior, ctx.config.pipeline.workers) {
        match outcome {
            Ok(outcome) => {
                collapsed += outcome.duplicates_collapsed;
                let touched = !outcome.new_entries.is_empty() || outcome.changed_current;
                // a collapsed duplicate that left the held copies as they were changes nothing
                if !touched && prior.get(&key) == Some(&outcome.canonical) {
                    continue;
                }
                if touched {
                    updated += 1;
                }
                new_observations.extend(outcome.new_entries.into_iter().map(|e| e.record));
                commit.canonical.push(outcome.canonical);
            }
            Err(e) => {
                conflicts += 1;
                warn!(entity_key = %key, error = %e, "canonical update skipped for entity");
                let detail = match e {
                    PipelineError::DeduplicationConflict { detail, .. } => detail,
                    other => other.to_string(),
                };
                report.dedup_conflicts.push(DedupConflict {
                    entity_key: key.to_string(),
                    detail,
                });
            }
        }
    }

    report.entities_updated += updated;
    report.duplicates_collapsed += collapsed;
    CanonicalMetrics::record_resolution(updated, collapsed, conflicts, started.elapsed().as_secs_f64());
    Ok(new_observations)
}

async fn aggregate(
    ctx: &RunContext,
    store: &dyn TierStore,
    new_observations: &[NormalizedRecord],
    commit: &mut BatchCommit,
    report: &mut RunReport,
) -> Result<()> {
    let mut canonical = BTreeMap::new();
    if ctx.aggregation.needs_canonical_view() {
        canonical = store.canonical_snapshot().await?;
        for record in &commit.canonical {
            canonical.insert(record.entity_key.clone(), record.clone());
        }
    }
    let prior_states = store.window_states().await?;

    let input = AggregationInput {
        run_id: &ctx.run_id,
        computed_at: Utc::now(),
        canonical: &canonical,
        new_observations,
    };

    let started = Instant::now();
    for outcome in ctx.aggregation.compute(&input, &prior_states) {
        match outcome.result {
            Ok(output) => {
                AggregationMetrics::record_product_computed(
                    &outcome.product,
                    output.table.rows.len(),
                    started.elapsed().as_secs_f64(),
                );
                AggregationMetrics::record_late_observations(&outcome.product, output.late_observations);
                report.late_observations += output.late_observations;
                report.observations_set_aside += output.rejected_observations;
                if let Some(state) = output.window_state {
                    commit.window_states.push((outcome.product.clone(), state));
                }
                commit.products.push(output.table);
                report.products_succeeded.push(outcome.product);
            }
            Err(e) => {
                AggregationMetrics::record_product_failure(&outcome.product);
                if let Some(state) = outcome.deferred_state {
                    debug!(product = %outcome.product, pending = state.pending.len(), "observations queued for next fold");
                    commit.window_states.push((outcome.product.clone(), state));
                }
                let reason = match e {
                    PipelineError::Aggregation { reason, .. } => reason,
                    other => other.to_string(),
                };
                report.products_failed.push(ProductFailure {
                    product: outcome.product,
                    reason,
                });
            }
        }
    }
    debug!(products = ctx.aggregation.products().len(), "aggregation finished");
    Ok(())
}
