//! Streaming controller metrics: commits, retries and stalls.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct StreamingMetrics;

impl StreamingMetrics {
    pub fn record_batch_committed(source_id: &str, end_offset: u64, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "streaming", "batches_committed"), "source_id" => source_id.to_string())
            .increment(1);
        ::metrics::gauge!(phase_metric!(gauge, "streaming", "checkpoint_offset"), "source_id" => source_id.to_string())
            .set(end_offset as f64);
        ::metrics::histogram!(phase_metric!(histogram, "streaming", "batch_duration_seconds")).record(duration_secs);
    }

    pub fn record_retry(source_id: &str) {
        ::metrics::counter!(phase_metric!(counter, "streaming", "read_retries"), "source_id" => source_id.to_string())
            .increment(1);
    }

    pub fn record_stall(source_id: &str) {
        ::metrics::counter!(phase_metric!(counter, "streaming", "source_stalls"), "source_id" => source_id.to_string())
            .increment(1);
    }

    pub fn record_replayed_batch(source_id: &str) {
        ::metrics::counter!(phase_metric!(counter, "streaming", "batches_skipped"), "source_id" => source_id.to_string())
            .increment(1);
    }
}

impl PhaseMetrics for StreamingMetrics {
    fn register_metrics() {
        use metrics::{counter, gauge, histogram};

        let _ = counter!(phase_metric!(counter, "streaming", "batches_committed"));
        let _ = counter!(phase_metric!(counter, "streaming", "read_retries"));
        let _ = counter!(phase_metric!(counter, "streaming", "source_stalls"));
        let _ = counter!(phase_metric!(counter, "streaming", "batches_skipped"));
        let _ = gauge!(phase_metric!(gauge, "streaming", "checkpoint_offset"));
        let _ = histogram!(phase_metric!(histogram, "streaming", "batch_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "streaming"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "streaming", "batches_committed"),
                metric_type: MetricType::Counter,
                help: "Micro-batches committed together with their checkpoint",
                labels: vec!["source_id"],
            },
            MetricDoc {
                name: phase_metric!(counter, "streaming", "read_retries"),
                metric_type: MetricType::Counter,
                help: "Failed source reads that were retried with backoff",
                labels: vec!["source_id"],
            },
            MetricDoc {
                name: phase_metric!(counter, "streaming", "source_stalls"),
                metric_type: MetricType::Counter,
                help: "Sources marked stalled after exhausting their retries",
                labels: vec!["source_id"],
            },
            MetricDoc {
                name: phase_metric!(counter, "streaming", "batches_skipped"),
                metric_type: MetricType::Counter,
                help: "Batches at or below the committed checkpoint that were skipped on resume",
                labels: vec!["source_id"],
            },
            MetricDoc {
                name: phase_metric!(gauge, "streaming", "checkpoint_offset"),
                metric_type: MetricType::Gauge,
                help: "Last committed source offset",
                labels: vec!["source_id"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "streaming", "batch_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Wall time to process and commit a micro-batch",
                labels: vec![],
            },
        ]
    }
}
