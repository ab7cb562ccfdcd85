//! Centralized metrics for the tierflow pipeline
//!
//! Each stage owns its metric names in a dedicated submodule. The recorder is installed
//! once per process; `render()` returns the Prometheus exposition text so short-lived
//! batch runs can print or persist it without running a scrape endpoint.

pub mod aggregation;
pub mod canonical;
pub mod ingestion;
pub mod quality_gate;
pub mod registry;
pub mod streaming;

pub use aggregation::AggregationMetrics;
pub use canonical::CanonicalMetrics;
pub use ingestion::IngestionMetrics;
pub use quality_gate::QualityGateMetrics;
pub use streaming::StreamingMetrics;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and register every stage's metrics. Idempotent.
///
/// When `TIERFLOW_METRICS_ADDR` is set an HTTP scrape endpoint serves the metrics;
/// otherwise they are only available through [`render`].
pub fn init_metrics() {
    INIT.call_once(|| {
        let builder = PrometheusBuilder::new();

        let listen_addr = std::env::var("TIERFLOW_METRICS_ADDR").ok().and_then(|addr_str| {
            match addr_str.parse::<std::net::SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Ignoring invalid TIERFLOW_METRICS_ADDR '{}': {}", addr_str, e);
                    None
                }
            }
        });

        let installed = match listen_addr {
            Some(addr) => builder.with_http_listener(addr).install().map(|()| {
                info!("Prometheus HTTP exporter listening on http://{}/metrics", addr);
            }),
            None => builder.install_recorder().map(|handle| {
                let _ = HANDLE.set(handle);
            }),
        };

        match installed {
            Ok(()) => {
                registry::register_all_metrics();
                info!("Pipeline metrics registered");
            }
            Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
        }
    });
}

/// Current metrics in Prometheus text format, if the in-process recorder is installed
pub fn render() -> Option<String> {
    HANDLE.get().map(|handle| handle.render())
}

/// Trait for stage-specific metric collections
pub trait PhaseMetrics {
    /// Touch every metric once so it shows up in the exposition before first use
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metrics_documentation() -> Vec<MetricDoc>;
}

#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Builds a metric name following `tierflow_<phase>_<name>[_total]`
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("tierflow_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("tierflow_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("tierflow_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
