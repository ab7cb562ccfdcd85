//! Canonical tier metrics: normalization outcomes and deduplication.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct CanonicalMetrics;

impl CanonicalMetrics {
    pub fn record_normalized(degraded_fields: usize) {
        ::metrics::counter!(phase_metric!(counter, "canonical", "normalized")).increment(1);
        if degraded_fields > 0 {
            ::metrics::counter!(phase_metric!(counter, "canonical", "degraded_fields"))
                .increment(degraded_fields as u64);
        }
    }

    pub fn record_normalize_failure() {
        ::metrics::counter!(phase_metric!(counter, "canonical", "normalize_failures")).increment(1);
    }

    pub fn record_resolution(entities_updated: usize, duplicates_collapsed: usize, conflicts: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "canonical", "entities_updated")).increment(entities_updated as u64);
        ::metrics::counter!(phase_metric!(counter, "canonical", "duplicates_collapsed"))
            .increment(duplicates_collapsed as u64);
        ::metrics::counter!(phase_metric!(counter, "canonical", "conflicts")).increment(conflicts as u64);
        ::metrics::histogram!(phase_metric!(histogram, "canonical", "resolve_duration_seconds")).record(duration_secs);
    }
}

impl PhaseMetrics for CanonicalMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "canonical", "normalized"));
        let _ = counter!(phase_metric!(counter, "canonical", "degraded_fields"));
        let _ = counter!(phase_metric!(counter, "canonical", "normalize_failures"));
        let _ = counter!(phase_metric!(counter, "canonical", "entities_updated"));
        let _ = counter!(phase_metric!(counter, "canonical", "duplicates_collapsed"));
        let _ = counter!(phase_metric!(counter, "canonical", "conflicts"));
        let _ = histogram!(phase_metric!(histogram, "canonical", "resolve_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "canonical"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "canonical", "normalized"),
                metric_type: MetricType::Counter,
                help: "Records normalized into canonical form",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "canonical", "degraded_fields"),
                metric_type: MetricType::Counter,
                help: "Fields set to null because they could not be normalized",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "canonical", "normalize_failures"),
                metric_type: MetricType::Counter,
                help: "Records rejected because a required field could not be normalized",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "canonical", "entities_updated"),
                metric_type: MetricType::Counter,
                help: "Canonical entities whose history changed",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "canonical", "duplicates_collapsed"),
                metric_type: MetricType::Counter,
                help: "Observations collapsed as exact duplicates",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "canonical", "conflicts"),
                metric_type: MetricType::Counter,
                help: "Entities skipped because of an unresolvable deduplication conflict",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "canonical", "resolve_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time spent resolving canonical records for a micro-batch",
                labels: vec![],
            },
        ]
    }
}
