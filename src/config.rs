use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::constants::DEFAULT_BATCH_SIZE;
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::aggregate::{AggregationEngine, ProductConfig, ProductSpec, WindowSpec};
use crate::pipeline::processing::dedup::{DedupConfig, DedupEngine};
use crate::pipeline::processing::normalize::{Normalizer, SchemaConfig, SchemaNormalizer, Vocabularies};
use crate::pipeline::processing::quality_gate::{QualityGate, RuleQualityGate, RulesConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    pub schema: SchemaConfig,
    pub rules: RulesConfig,
    /// vocabulary name -> (alias -> canonical label)
    #[serde(default)]
    pub vocabularies: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub products: Vec<ProductConfig>,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_name")]
    pub name: String,
    /// Shards resolved in parallel by the batch runner
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts after the first failed read before the source is marked stalled
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_name() -> String {
    "tierflow".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema.entity_key.trim().is_empty() {
            return Err(PipelineError::Config("schema.entity_key must be set".into()));
        }
        if self.pipeline.workers == 0 {
            return Err(PipelineError::Config("pipeline.workers must be at least 1".into()));
        }
        if self.streaming.batch_size == 0 {
            return Err(PipelineError::Config("streaming.batch_size must be at least 1".into()));
        }

        let mut rule_names = HashSet::new();
        for rule in &self.rules.rules {
            if !rule_names.insert(rule.name.as_str()) {
                return Err(PipelineError::Config(format!("duplicate rule name '{}'", rule.name)));
            }
        }

        let mut product_names = HashSet::new();
        for product in &self.products {
            if !product_names.insert(product.name.as_str()) {
                return Err(PipelineError::Config(format!("duplicate product name '{}'", product.name)));
            }
            let problem = match &product.spec {
                ProductSpec::Windowed(spec) if spec.measures.is_empty() => Some("needs at least one measure"),
                ProductSpec::Windowed(spec) if spec.window == WindowSpec::Minutes(0) => {
                    Some("window width must be positive")
                }
                ProductSpec::Windowed(spec) if spec.retention_secs.map_or(false, |r| r < 0) => {
                    Some("retention_secs must not be negative")
                }
                ProductSpec::Segment { measures, .. } if measures.is_empty() => Some("needs at least one measure"),
                ProductSpec::Segment { segment_by, .. } if segment_by.is_empty() => {
                    Some("needs at least one segment field")
                }
                ProductSpec::Ranked { top_n: 0, .. } => Some("top_n must be positive"),
                _ => None,
            };
            if let Some(problem) = problem {
                return Err(PipelineError::Config(format!("product '{}' {}", product.name, problem)));
            }
        }
        Ok(())
    }
}

/// Immutable per-run context: configuration plus every compiled stage. Built once when a
/// run starts and shared by reference with each micro-batch.
pub struct RunContext {
    pub run_id: String,
    pub config: Arc<PipelineConfig>,
    pub vocabularies: Arc<Vocabularies>,
    pub gate: Arc<dyn QualityGate>,
    pub normalizer: Arc<dyn Normalizer>,
    pub dedup: DedupEngine,
    pub aggregation: AggregationEngine,
}

impl RunContext {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let gate = RuleQualityGate::from_config(&config.rules)?;
        Self::with_gate(config, Arc::new(gate))
    }

    /// Build with a caller-supplied gate, e.g. one extended with custom checks
    pub fn with_gate(config: PipelineConfig, gate: Arc<dyn QualityGate>) -> Result<Self> {
        config.validate()?;
        let vocabularies = Arc::new(Vocabularies::from_tables(&config.vocabularies));
        let normalizer = SchemaNormalizer::from_config(&config.schema, vocabularies.clone())?;
        let dedup = DedupEngine::new(&config.dedup);
        let aggregation = AggregationEngine::new(config.products.clone());
        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            config: Arc::new(config),
            vocabularies,
            gate,
            normalizer: Arc::new(normalizer),
            dedup,
            aggregation,
        })
    }

    pub fn rule_version(&self) -> &str {
        self.gate.rule_version()
    }
}
