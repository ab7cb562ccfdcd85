use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tierflow::config::{PipelineConfig, RunContext};
use tierflow::logging;
use tierflow::metrics;
use tierflow::pipeline::audit::{Auditor, Revalidation};
use tierflow::pipeline::ingestion::{IngestionAdapter, NdjsonFileAdapter, SyntheticEventAdapter};
use tierflow::pipeline::processing::aggregate::ProductTable;
use tierflow::pipeline::storage::{InMemoryTierStore, QuarantineStatus, SqliteTierStore, TierStore};
use tierflow::pipeline::{run_batch, RunReport, StreamingController};

#[derive(Parser)]
#[command(name = "tierflow")]
#[command(about = "Tiered raw → canonical → analytics pipeline")]
#[command(version)]
struct Cli {
    /// Pipeline configuration (TOML)
    #[arg(long, global = true, env = "TIERFLOW_CONFIG", default_value = "config/credit_profiles.toml")]
    config: PathBuf,

    /// SQLite tier store; an in-memory store is used when absent
    #[arg(long, global = true, env = "TIERFLOW_DB")]
    db: Option<PathBuf>,

    /// Directory for rotated JSON logs
    #[arg(long, global = true, env = "TIERFLOW_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Print the Prometheus metrics snapshot when the command finishes
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One bounded batch run over an NDJSON file
    Batch {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "file")]
        source: String,
    },
    /// Streaming run in micro-batches, resuming from the source checkpoint
    Stream {
        /// NDJSON file to stream
        #[arg(long, conflicts_with = "synthetic")]
        input: Option<PathBuf>,
        /// Generate random click-stream events instead of reading a file
        #[arg(long)]
        synthetic: bool,
        #[arg(long, default_value = "file")]
        source: String,
        /// Records per micro-batch (defaults to streaming.batch_size)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stop after this many micro-batches
        #[arg(long)]
        batches: Option<u64>,
        /// Synthetic events per micro-batch
        #[arg(long, default_value_t = 10)]
        rate: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Inspect and remediate quarantined records
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },
    /// Print the latest analytics product tables
    Products {
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// List quarantined records and their status
    List {
        /// Include released and resubmitted entries
        #[arg(long)]
        all: bool,
    },
    /// Re-validate a held record under the current rules
    Revalidate { record_id: String },
    /// Replace a held record with corrected fields
    Resubmit {
        record_id: String,
        /// Corrected record as a JSON object
        #[arg(long)]
        fields: String,
    },
}

fn open_store(db: Option<&PathBuf>) -> anyhow::Result<Arc<dyn TierStore>> {
    Ok(match db {
        Some(path) => Arc::new(
            SqliteTierStore::open(path).with_context(|| format!("opening tier store {}", path.display()))?,
        ),
        None => {
            warn!("No --db given, using an in-memory tier store; results are not persisted");
            Arc::new(InMemoryTierStore::new())
        }
    })
}

fn print_report(report: &RunReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn print_product(table: &ProductTable) {
    println!(
        "\n📊 {} ({}, version {}, run {})",
        table.product, table.kind, table.version, table.run_id
    );
    println!("   {}", table.columns.join(" | "));
    for row in &table.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("   {}", cells.join(" | "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let guard = logging::init_logging(&cli.log_dir);
    metrics::init_metrics();

    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading pipeline config {}", cli.config.display()))?;
    let ctx = RunContext::new(config)?;
    info!(run_id = %ctx.run_id, pipeline = %ctx.config.pipeline.name, rule_version = %ctx.rule_version(), "run context ready");
    let store = open_store(cli.db.as_ref())?;

    let mut failed = false;
    match cli.command {
        Commands::Batch { input, source } => {
            let mut adapter = NdjsonFileAdapter::new(source, input, ctx.config.streaming.batch_size);
            let report = run_batch(&ctx, store.as_ref(), &mut adapter).await?;
            failed = report.has_failures();
            print_report(&report)?;
        }
        Commands::Stream {
            input,
            synthetic,
            source,
            batch_size,
            batches,
            rate,
            seed,
        } => {
            let batch_size = batch_size.unwrap_or(ctx.config.streaming.batch_size);
            let mut adapter: Box<dyn IngestionAdapter> = match (input, synthetic) {
                (Some(path), false) => Box::new(NdjsonFileAdapter::new(source, path, batch_size)),
                (None, true) => Box::new(SyntheticEventAdapter::new("synthetic", rate, batches, seed)),
                _ => bail!("stream needs exactly one of --input or --synthetic"),
            };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, finishing the current micro-batch");
                    let _ = shutdown_tx.send(true);
                }
            });

            let mut controller = StreamingController::new(&ctx, store.as_ref()).with_shutdown(shutdown_rx);
            if let Some(n) = batches {
                controller = controller.with_max_batches(n as usize);
            }
            let report = controller.run(adapter.as_mut()).await?;
            failed = report.has_failures();
            print_report(&report)?;
        }
        Commands::Quarantine { action } => {
            let auditor = Auditor::new(&ctx, store.as_ref());
            match action {
                QuarantineAction::List { all } => {
                    let entries = if all {
                        auditor.list_quarantine().await?
                    } else {
                        auditor.held().await?
                    };
                    println!("{} quarantined record(s)", entries.len());
                    for entry in entries {
                        let status = match &entry.status {
                            QuarantineStatus::Held => "held".to_string(),
                            QuarantineStatus::Released => "released".to_string(),
                            QuarantineStatus::Resubmitted { replacement_id } => {
                                format!("resubmitted as {}", replacement_id)
                            }
                        };
                        println!(
                            "  {} [{}] source={} offset={} rules={}: {}",
                            entry.record.record_id,
                            status,
                            entry.record.meta.source_id,
                            entry.record.meta.offset,
                            entry.rule_version,
                            entry.failures.join("; ")
                        );
                    }
                }
                QuarantineAction::Revalidate { record_id } => match auditor.revalidate(&record_id).await? {
                    Revalidation::Released(report) => {
                        println!("✅ {} released", record_id);
                        print_report(&report)?;
                    }
                    Revalidation::StillHeld { failures } => {
                        println!("⚠️  {} still fails: {}", record_id, failures.join("; "));
                        failed = true;
                    }
                },
                QuarantineAction::Resubmit { record_id, fields } => {
                    let fields: Map<String, Value> =
                        serde_json::from_str(&fields).context("--fields must be a JSON object")?;
                    let resubmission = auditor.resubmit(&record_id, fields).await?;
                    println!("✅ {} resubmitted as {}", record_id, resubmission.replacement_id);
                    print_report(&resubmission.report)?;
                }
            }
        }
        Commands::Products { name } => {
            let names = match name {
                Some(name) => vec![name],
                None => store.product_names().await?,
            };
            if names.is_empty() {
                println!("No analytics products have been computed yet");
            }
            for name in names {
                match store.latest_product(&name).await? {
                    Some(table) => print_product(&table),
                    None => {
                        error!(product = %name, "no stored version");
                        failed = true;
                    }
                }
            }
        }
    }

    if cli.print_metrics {
        match metrics::render() {
            Some(text) => println!("\n{}", text),
            None => warn!("Metrics recorder not installed in-process; nothing to print"),
        }
    }

    if failed {
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}
