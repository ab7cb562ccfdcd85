use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use tracing::{debug, warn};

use super::{IngestBatch, IngestionAdapter};
use crate::domain::{IngestMetadata, RawRecord};
use crate::error::{PipelineError, Result};

/// Reads one JSON object per line. The offset of a record is its 1-based line number and the
/// partition is the file name.
pub struct NdjsonFileAdapter {
    source_id: String,
    path: PathBuf,
    partition: String,
    batch_size: usize,
    skip_through: u64,
    line_no: u64,
    lines: Option<Lines<BufReader<File>>>,
}

impl NdjsonFileAdapter {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>, batch_size: usize) -> Self {
        let path = path.into();
        let partition = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "ndjson".to_string());
        Self {
            source_id: source_id.into(),
            path,
            partition,
            batch_size: batch_size.max(1),
            skip_through: 0,
            line_no: 0,
            lines: None,
        }
    }

    fn lines(&mut self) -> Result<&mut Lines<BufReader<File>>> {
        if self.lines.is_none() {
            let file = File::open(&self.path).map_err(|e| {
                PipelineError::ingestion(&self.source_id, format!("cannot open {}: {}", self.path.display(), e))
            })?;
            self.lines = Some(BufReader::new(file).lines());
        }
        self.lines
            .as_mut()
            .ok_or_else(|| PipelineError::ingestion(&self.source_id, "reader unavailable"))
    }
}

#[async_trait]
impl IngestionAdapter for NdjsonFileAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn resume_after(&mut self, offset: u64) -> Result<()> {
        self.skip_through = offset;
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<IngestBatch>> {
        let source_id = self.source_id.clone();
        let partition = self.partition.clone();
        let skip_through = self.skip_through;
        let batch_size = self.batch_size;
        let mut line_no = self.line_no;

        let mut records = Vec::new();
        let mut malformed = 0;
        let mut exhausted = false;
        {
            let lines = self.lines()?;
            while records.len() + malformed < batch_size {
                let Some(line) = lines.next() else {
                    exhausted = true;
                    break;
                };
                let line = line.map_err(|e| PipelineError::ingestion(&source_id, e.to_string()))?;
                line_no += 1;
                if line_no <= skip_through || line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(Value::Object(fields)) => records.push(RawRecord::new(
                        fields,
                        IngestMetadata {
                            source_id: source_id.clone(),
                            ingested_at: Utc::now(),
                            source_partition: partition.clone(),
                            offset: line_no,
                        },
                    )),
                    Ok(_) | Err(_) => {
                        warn!(source = %source_id, line = line_no, "skipping malformed NDJSON line");
                        malformed += 1;
                    }
                }
            }
        }
        self.line_no = line_no;

        if exhausted && records.is_empty() && malformed == 0 {
            return Ok(None);
        }
        debug!(source = %source_id, records = records.len(), end_offset = line_no, "read NDJSON batch");
        Ok(Some(IngestBatch {
            source_id,
            records,
            end_offset: line_no,
            malformed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_batches_and_resumes_after_offset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 1..=5 {
            writeln!(file, "{{\"customer_id\": \"C{}\"}}", i).unwrap();
        }
        writeln!(file, "not json").unwrap();

        let mut adapter = NdjsonFileAdapter::new("core", file.path(), 2);
        adapter.resume_after(2).await.unwrap();

        let first = adapter.next_batch().await.unwrap().unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].meta.offset, 3);
        assert_eq!(first.end_offset, 4);

        let second = adapter.next_batch().await.unwrap().unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.malformed, 1);
        assert_eq!(second.end_offset, 6);

        assert!(adapter.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_an_ingestion_error() {
        let mut adapter = NdjsonFileAdapter::new("core", "/nonexistent/input.ndjson", 10);
        let err = adapter.next_batch().await.unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion { .. }));
    }
}
