//! Registers every stage's metrics and detects name clashes between stages.

use crate::metrics::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{info, warn};

pub fn register_all_metrics() {
    let mut all_metrics: HashMap<String, (&'static str, MetricDoc)> = HashMap::new();

    register_phase_metrics::<super::ingestion::IngestionMetrics>(&mut all_metrics);
    register_phase_metrics::<super::quality_gate::QualityGateMetrics>(&mut all_metrics);
    register_phase_metrics::<super::canonical::CanonicalMetrics>(&mut all_metrics);
    register_phase_metrics::<super::aggregation::AggregationMetrics>(&mut all_metrics);
    register_phase_metrics::<super::streaming::StreamingMetrics>(&mut all_metrics);

    info!("Registered {} metrics across all phases", all_metrics.len());

    if std::env::var("TIERFLOW_METRICS_DEBUG").is_ok() {
        log_metrics_summary(&all_metrics);
    }
}

fn register_phase_metrics<T: PhaseMetrics>(all_metrics: &mut HashMap<String, (&'static str, MetricDoc)>) {
    T::register_metrics();
    let phase_name = T::phase_name();

    for doc in T::metrics_documentation() {
        if let Some((owner, _)) = all_metrics.get(doc.name) {
            warn!(
                "Metric name conflict: '{}' is defined by both '{}' and '{}'",
                doc.name, owner, phase_name
            );
        } else {
            all_metrics.insert(doc.name.to_string(), (phase_name, doc));
        }
    }
}

fn log_metrics_summary(all_metrics: &HashMap<String, (&'static str, MetricDoc)>) {
    let mut by_phase: HashMap<&str, Vec<&MetricDoc>> = HashMap::new();
    for doc in all_metrics.values().map(|(_, doc)| doc) {
        by_phase.entry(extract_phase_from_metric_name(doc.name)).or_default().push(doc);
    }

    for (phase, docs) in by_phase {
        info!("Phase '{}': {} metrics", phase, docs.len());
        for doc in docs {
            info!("  - {} ({:?}): {}", doc.name, doc.metric_type, doc.help);
        }
    }
}

/// "tierflow_quality_gate_rejected_total" -> "quality_gate"
fn extract_phase_from_metric_name(metric_name: &str) -> &str {
    const PHASES: [&str; 5] = ["ingestion", "quality_gate", "canonical", "aggregation", "streaming"];
    metric_name
        .strip_prefix("tierflow_")
        .and_then(|rest| PHASES.iter().find(|p| rest.starts_with(&format!("{}_", p))).copied())
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{AggregationMetrics, CanonicalMetrics, IngestionMetrics, QualityGateMetrics, StreamingMetrics};
    use std::collections::HashSet;

    #[test]
    fn test_extract_phase_from_metric_name() {
        assert_eq!(extract_phase_from_metric_name("tierflow_quality_gate_rejected_total"), "quality_gate");
        assert_eq!(extract_phase_from_metric_name("tierflow_aggregation_duration_seconds"), "aggregation");
        assert_eq!(extract_phase_from_metric_name("legacy_parser_errors_total"), "unknown");
    }

    #[test]
    fn test_metric_names_are_unique_across_phases() {
        let docs: Vec<MetricDoc> = [
            IngestionMetrics::metrics_documentation(),
            QualityGateMetrics::metrics_documentation(),
            CanonicalMetrics::metrics_documentation(),
            AggregationMetrics::metrics_documentation(),
            StreamingMetrics::metrics_documentation(),
        ]
        .concat();
        let names: HashSet<&str> = docs.iter().map(|d| d.name).collect();
        assert_eq!(names.len(), docs.len());
        assert!(docs.iter().all(|d| extract_phase_from_metric_name(d.name) != "unknown"));
    }
}
