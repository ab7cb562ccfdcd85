/// Label assigned to categorical values missing from the vocabulary
pub const UNCLASSIFIED_LABEL: &str = "unclassified";

/// Group label used when a grouping field is null
pub const NULL_GROUP_LABEL: &str = "(null)";

/// Source partition stamped on records resubmitted from quarantine
pub const REMEDIATION_PARTITION: &str = "remediation";

/// Rule name prefix for verdicts produced by normalization of required fields
pub const NORMALIZE_RULE_PREFIX: &str = "normalize.";

// Output column names shared by all analytics products
pub const COL_ENTITY_KEY: &str = "entity_key";
pub const COL_OBSERVED_AT: &str = "observed_at";
pub const COL_WINDOW_START: &str = "window_start";
pub const COL_WINDOW_END: &str = "window_end";
pub const COL_REVISION: &str = "revision";
pub const COL_CORRECTION: &str = "correction";
pub const COL_RANK: &str = "rank";

/// Pseudo-field that groups by entity key in windowed products
pub const ENTITY_KEY_GROUP: &str = "@entity_key";

/// Default micro-batch size for file-backed streaming
pub const DEFAULT_BATCH_SIZE: usize = 500;
