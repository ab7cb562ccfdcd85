//! Streaming controller: repeatedly pulls micro-batches from one source and runs each
//! through the pipeline, committing the source checkpoint with the batch's results.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{RunContext, StreamingConfig};
use crate::error::{PipelineError, Result};
use crate::metrics::StreamingMetrics;
use crate::pipeline::ingestion::{IngestBatch, IngestionAdapter};
use crate::pipeline::runner::{process_batch, RunReport, SourceStatus};
use crate::pipeline::storage::TierStore;

pub struct StreamingController<'a> {
    ctx: &'a RunContext,
    store: &'a dyn TierStore,
    config: StreamingConfig,
    shutdown: Option<watch::Receiver<bool>>,
    max_batches: Option<usize>,
}

impl<'a> StreamingController<'a> {
    pub fn new(ctx: &'a RunContext, store: &'a dyn TierStore) -> Self {
        Self {
            ctx,
            store,
            config: ctx.config.streaming.clone(),
            shutdown: None,
            max_batches: None,
        }
    }

    /// Stop between micro-batches once the signal flips to `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Stop after this many committed micro-batches
    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = Some(max_batches);
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Run until the source ends, stalls, or shutdown is requested.
    ///
    /// A stalled source is reported in the returned [`RunReport`]; only store failures
    /// surface as errors.
    pub async fn run(&self, adapter: &mut dyn IngestionAdapter) -> Result<RunReport> {
        let source_id = adapter.source_id().to_string();
        let mut report = RunReport::new(&self.ctx.run_id);

        let mut committed = self
            .store
            .checkpoint(&source_id)
            .await?
            .map(|c| c.offset)
            .unwrap_or(0);
        if committed > 0 {
            info!(source = %source_id, offset = committed, "resuming after checkpoint");
        }
        adapter.resume_after(committed).await?;
        report.last_offset = Some(committed);

        loop {
            if self.shutdown_requested() {
                info!(source = %source_id, "shutdown requested, stopping between micro-batches");
                report.source_status = SourceStatus::Cancelled;
                break;
            }
            if self.max_batches.is_some_and(|max| report.batches >= max) {
                break;
            }

            let batch = match self.read_with_retry(adapter).await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    info!(source = %source_id, batches = report.batches, "source exhausted");
                    break;
                }
                Err(PipelineError::SourceStalled {
                    attempts, last_error, ..
                }) => {
                    error!(source = %source_id, attempts, error = %last_error, "source stalled");
                    StreamingMetrics::record_stall(&source_id);
                    report.source_status = SourceStatus::Stalled { attempts, last_error };
                    break;
                }
                Err(e) => return Err(e),
            };

            if batch.end_offset <= committed {
                debug!(source = %source_id, end_offset = batch.end_offset, "skipping already committed batch");
                StreamingMetrics::record_replayed_batch(&source_id);
                continue;
            }

            let started = Instant::now();
            let batch_report = process_batch(self.ctx, self.store, &batch, Some(batch.end_offset)).await?;
            committed = batch.end_offset;
            StreamingMetrics::record_batch_committed(&source_id, committed, started.elapsed().as_secs_f64());
            report.absorb(batch_report);
        }

        Ok(report)
    }

    /// Read the next batch, retrying failed reads with exponential backoff
    async fn read_with_retry(&self, adapter: &mut dyn IngestionAdapter) -> Result<Option<IngestBatch>> {
        let mut attempt: u32 = 0;
        loop {
            match adapter.next_batch().await {
                Ok(batch) => return Ok(batch),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = backoff_delay(&self.config, attempt);
                    attempt += 1;
                    warn!(
                        source = %adapter.source_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "source read failed, retrying"
                    );
                    StreamingMetrics::record_retry(adapter.source_id());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(PipelineError::SourceStalled {
                        source_id: adapter.source_id().to_string(),
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    })
                }
            }
        }
    }
}

/// `backoff_ms * 2^attempt`, capped at `max_backoff_ms`
fn backoff_delay(config: &StreamingConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(config.backoff_ms.saturating_mul(factor).min(config.max_backoff_ms))
}
