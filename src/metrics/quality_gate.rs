//! Quality Gate metrics: routing decisions and quarantine remediation.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};
use crate::pipeline::processing::quality_gate::QualityDecision;

pub struct QualityGateMetrics;

impl QualityGateMetrics {
    pub fn record_decision(decision: QualityDecision) {
        ::metrics::counter!(phase_metric!(counter, "quality_gate", "records_assessed")).increment(1);
        match decision {
            QualityDecision::Accept => {
                ::metrics::counter!(phase_metric!(counter, "quality_gate", "accepted")).increment(1)
            }
            QualityDecision::AcceptWithWarnings => {
                ::metrics::counter!(phase_metric!(counter, "quality_gate", "warned")).increment(1)
            }
            QualityDecision::Quarantine => {
                ::metrics::counter!(phase_metric!(counter, "quality_gate", "quarantined")).increment(1)
            }
            QualityDecision::Reject => {
                ::metrics::counter!(phase_metric!(counter, "quality_gate", "rejected")).increment(1)
            }
        }
    }

    pub fn record_released() {
        ::metrics::counter!(phase_metric!(counter, "quality_gate", "released")).increment(1);
    }

    pub fn record_resubmitted() {
        ::metrics::counter!(phase_metric!(counter, "quality_gate", "resubmitted")).increment(1);
    }
}

impl PhaseMetrics for QualityGateMetrics {
    fn register_metrics() {
        use metrics::counter;

        let _ = counter!(phase_metric!(counter, "quality_gate", "records_assessed"));
        let _ = counter!(phase_metric!(counter, "quality_gate", "accepted"));
        let _ = counter!(phase_metric!(counter, "quality_gate", "warned"));
        let _ = counter!(phase_metric!(counter, "quality_gate", "quarantined"));
        let _ = counter!(phase_metric!(counter, "quality_gate", "rejected"));
        let _ = counter!(phase_metric!(counter, "quality_gate", "released"));
        let _ = counter!(phase_metric!(counter, "quality_gate", "resubmitted"));
    }

    fn phase_name() -> &'static str {
        "quality_gate"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "quality_gate", "records_assessed"),
                metric_type: MetricType::Counter,
                help: "Records evaluated against the active rule set",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "quality_gate", "accepted"),
                metric_type: MetricType::Counter,
                help: "Records that passed every rule",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "quality_gate", "warned"),
                metric_type: MetricType::Counter,
                help: "Records accepted with at least one warning",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "quality_gate", "quarantined"),
                metric_type: MetricType::Counter,
                help: "Records held in quarantine for remediation",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "quality_gate", "rejected"),
                metric_type: MetricType::Counter,
                help: "Records rejected outright",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "quality_gate", "released"),
                metric_type: MetricType::Counter,
                help: "Quarantined records released after re-validation",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "quality_gate", "resubmitted"),
                metric_type: MetricType::Counter,
                help: "Quarantined records superseded by a corrected resubmission",
                labels: vec![],
            },
        ]
    }
}
