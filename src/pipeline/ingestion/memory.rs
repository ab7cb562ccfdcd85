use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;

use super::{IngestBatch, IngestionAdapter};
use crate::domain::{IngestMetadata, RawRecord};
use crate::error::{PipelineError, Result};

/// Serves pre-built batches of JSON objects. Useful for tests, demos and remediation
/// resubmissions. Transient failures can be injected to exercise retry handling.
pub struct MemoryAdapter {
    source_id: String,
    partition: String,
    batches: VecDeque<Vec<Value>>,
    next_offset: u64,
    skip_through: u64,
    ingested_at: Option<DateTime<Utc>>,
    failures_remaining: u32,
}

impl MemoryAdapter {
    /// One batch per inner vector, in order
    pub fn from_batches(source_id: impl Into<String>, batches: Vec<Vec<Value>>) -> Self {
        Self {
            source_id: source_id.into(),
            partition: "memory".to_string(),
            batches: batches.into(),
            next_offset: 1,
            skip_through: 0,
            ingested_at: None,
            failures_remaining: 0,
        }
    }

    pub fn new(source_id: impl Into<String>, rows: Vec<Value>, batch_size: usize) -> Self {
        let batches = rows
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        Self::from_batches(source_id, batches)
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Stamp every record with a fixed ingestion time
    pub fn with_ingested_at(mut self, at: DateTime<Utc>) -> Self {
        self.ingested_at = Some(at);
        self
    }

    /// Fail the next `n` calls to `next_batch` without consuming anything
    pub fn with_transient_failures(mut self, n: u32) -> Self {
        self.failures_remaining = n;
        self
    }
}

#[async_trait]
impl IngestionAdapter for MemoryAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn resume_after(&mut self, offset: u64) -> Result<()> {
        self.skip_through = offset;
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<IngestBatch>> {
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(PipelineError::ingestion(&self.source_id, "injected transient failure"));
        }

        loop {
            let Some(rows) = self.batches.pop_front() else {
                return Ok(None);
            };
            let mut records = Vec::with_capacity(rows.len());
            let mut malformed = 0;
            for row in rows {
                let offset = self.next_offset;
                self.next_offset += 1;
                if offset <= self.skip_through {
                    continue;
                }
                match row {
                    Value::Object(fields) => records.push(RawRecord::new(
                        fields,
                        IngestMetadata {
                            source_id: self.source_id.clone(),
                            ingested_at: self.ingested_at.unwrap_or_else(Utc::now),
                            source_partition: self.partition.clone(),
                            offset,
                        },
                    )),
                    _ => malformed += 1,
                }
            }
            if records.is_empty() && malformed == 0 {
                // whole batch was at or below the resume point
                continue;
            }
            return Ok(Some(IngestBatch {
                source_id: self.source_id.clone(),
                records,
                end_offset: self.next_offset - 1,
                malformed,
            }));
        }
    }
}
