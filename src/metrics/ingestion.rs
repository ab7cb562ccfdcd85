//! Ingestion metrics: micro-batches read from sources and raw-log appends.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct IngestionMetrics;

impl IngestionMetrics {
    pub fn record_batch_read(source_id: &str, records: usize, malformed: usize) {
        ::metrics::counter!(phase_metric!(counter, "ingestion", "batches_read"), "source_id" => source_id.to_string())
            .increment(1);
        ::metrics::counter!(phase_metric!(counter, "ingestion", "records_read"), "source_id" => source_id.to_string())
            .increment(records as u64);
        if malformed > 0 {
            ::metrics::counter!(phase_metric!(counter, "ingestion", "malformed"), "source_id" => source_id.to_string())
                .increment(malformed as u64);
        }
        ::metrics::histogram!(phase_metric!(histogram, "ingestion", "batch_size_records")).record(records as f64);
    }

    /// `appended` new raw records out of `offered`; the rest were replays
    pub fn record_raw_append(appended: usize, offered: usize) {
        ::metrics::counter!(phase_metric!(counter, "ingestion", "raw_appended")).increment(appended as u64);
        let replayed = offered.saturating_sub(appended);
        if replayed > 0 {
            ::metrics::counter!(phase_metric!(counter, "ingestion", "raw_replayed")).increment(replayed as u64);
        }
    }
}

impl PhaseMetrics for IngestionMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "ingestion", "batches_read"));
        let _ = counter!(phase_metric!(counter, "ingestion", "records_read"));
        let _ = counter!(phase_metric!(counter, "ingestion", "malformed"));
        let _ = counter!(phase_metric!(counter, "ingestion", "raw_appended"));
        let _ = counter!(phase_metric!(counter, "ingestion", "raw_replayed"));
        let _ = histogram!(phase_metric!(histogram, "ingestion", "batch_size_records"));
    }

    fn phase_name() -> &'static str {
        "ingestion"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "ingestion", "batches_read"),
                metric_type: MetricType::Counter,
                help: "Micro-batches read from ingestion adapters",
                labels: vec!["source_id"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingestion", "records_read"),
                metric_type: MetricType::Counter,
                help: "Raw records read from ingestion adapters",
                labels: vec!["source_id"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingestion", "malformed"),
                metric_type: MetricType::Counter,
                help: "Source lines or messages that could not be read as records",
                labels: vec!["source_id"],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingestion", "raw_appended"),
                metric_type: MetricType::Counter,
                help: "Records newly appended to the raw log",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "ingestion", "raw_replayed"),
                metric_type: MetricType::Counter,
                help: "Records already present in the raw log when re-ingested",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "ingestion", "batch_size_records"),
                metric_type: MetricType::Histogram,
                help: "Records per micro-batch",
                labels: vec![],
            },
        ]
    }
}
