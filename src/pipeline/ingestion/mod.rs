// Pipeline ingestion: adapters that hand raw records to the pipeline in micro-batches

pub mod memory;
pub mod ndjson;
pub mod synthetic;

use async_trait::async_trait;

use crate::domain::RawRecord;
use crate::error::Result;

pub use memory::MemoryAdapter;
pub use ndjson::NdjsonFileAdapter;
pub use synthetic::SyntheticEventAdapter;

/// One micro-batch as produced by an adapter
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub source_id: String,
    pub records: Vec<RawRecord>,
    /// Offset of the last position consumed by this batch (checkpointed on commit)
    pub end_offset: u64,
    /// Lines or messages the adapter could not turn into records
    pub malformed: usize,
}

/// Source of raw records. Offsets are monotonically increasing per source.
#[async_trait]
pub trait IngestionAdapter: Send {
    fn source_id(&self) -> &str;

    /// Skip every position at or below `offset`; used to resume from a checkpoint
    async fn resume_after(&mut self, offset: u64) -> Result<()>;

    /// Next micro-batch, or `None` at end of stream
    async fn next_batch(&mut self) -> Result<Option<IngestBatch>>;
}
