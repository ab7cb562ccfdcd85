// Pipeline processing: validation, normalization, deduplication and aggregation

pub mod aggregate;
pub mod dedup;
pub mod normalize;
pub mod quality_gate;
