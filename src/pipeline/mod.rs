// Data pipeline: ingestion, processing stages, tier storage and the drivers over them

pub mod audit;
pub mod ingestion;
pub mod processing;
pub mod runner;
pub mod storage;
pub mod streaming;

pub use audit::Auditor;
pub use runner::{process_batch, run_batch, RunReport, SourceStatus};
pub use streaming::StreamingController;
