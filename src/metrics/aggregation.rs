//! Aggregation metrics: product computation and late data.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct AggregationMetrics;

impl AggregationMetrics {
    pub fn record_product_computed(product: &str, rows: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "aggregation", "products_computed"), "product" => product.to_string())
            .increment(1);
        ::metrics::gauge!(phase_metric!(gauge, "aggregation", "product_rows"), "product" => product.to_string())
            .set(rows as f64);
        ::metrics::histogram!(phase_metric!(histogram, "aggregation", "duration_seconds")).record(duration_secs);
    }

    pub fn record_product_failure(product: &str) {
        ::metrics::counter!(phase_metric!(counter, "aggregation", "product_failures"), "product" => product.to_string())
            .increment(1);
    }

    pub fn record_late_observations(product: &str, count: usize) {
        if count > 0 {
            ::metrics::counter!(phase_metric!(counter, "aggregation", "late_observations"), "product" => product.to_string())
                .increment(count as u64);
        }
    }
}

impl PhaseMetrics for AggregationMetrics {
    fn register_metrics() {
        use metrics::{counter, gauge, histogram};

        let _ = counter!(phase_metric!(counter, "aggregation", "products_computed"));
        let _ = counter!(phase_metric!(counter, "aggregation", "product_failures"));
        let _ = counter!(phase_metric!(counter, "aggregation", "late_observations"));
        let _ = gauge!(phase_metric!(gauge, "aggregation", "product_rows"));
        let _ = histogram!(phase_metric!(histogram, "aggregation", "duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "aggregation"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "aggregation", "products_computed"),
                metric_type: MetricType::Counter,
                help: "Analytics product versions computed",
                labels: vec!["product"],
            },
            MetricDoc {
                name: phase_metric!(counter, "aggregation", "product_failures"),
                metric_type: MetricType::Counter,
                help: "Analytics product computations that failed and kept their previous version",
                labels: vec!["product"],
            },
            MetricDoc {
                name: phase_metric!(counter, "aggregation", "late_observations"),
                metric_type: MetricType::Counter,
                help: "Observations that landed in an already finalized window",
                labels: vec!["product"],
            },
            MetricDoc {
                name: phase_metric!(gauge, "aggregation", "product_rows"),
                metric_type: MetricType::Gauge,
                help: "Rows in the latest version of each product",
                labels: vec!["product"],
            },
            MetricDoc {
                name: phase_metric!(histogram, "aggregation", "duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time spent computing a product",
                labels: vec![],
            },
        ]
    }
}
