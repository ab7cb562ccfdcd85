use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{BatchCommit, Checkpoint, CommitReceipt, QuarantineEntry, QuarantineStatus, TierStore};
use crate::domain::{CanonicalRecord, EntityKey, HistoryEntry, NormalizedRecord, RawRecord};
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::aggregate::{ProductTable, WindowState};
use crate::pipeline::processing::quality_gate::{ValidationVerdict, VerdictOutcome};

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
CREATE TABLE IF NOT EXISTS raw_records (
    record_id        TEXT PRIMARY KEY,
    source_id        TEXT NOT NULL,
    source_partition TEXT NOT NULL,
    source_offset    INTEGER NOT NULL,
    ingested_at      TEXT NOT NULL,
    ingest_day       TEXT NOT NULL,
    fields_json      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_raw_ingest_day ON raw_records(ingest_day);
CREATE TABLE IF NOT EXISTS validation_verdicts (
    record_id    TEXT NOT NULL,
    rule_name    TEXT NOT NULL,
    rule_version TEXT NOT NULL,
    outcome      TEXT NOT NULL,
    reason       TEXT,
    evaluated_at TEXT NOT NULL,
    PRIMARY KEY (record_id, rule_name, rule_version)
);
CREATE TABLE IF NOT EXISTS quarantine (
    record_id      TEXT PRIMARY KEY,
    entry_json     TEXT NOT NULL,
    quarantined_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS canonical_current (
    entity_key  TEXT PRIMARY KEY,
    observed_at TEXT NOT NULL,
    record_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS canonical_history (
    entity_key   TEXT NOT NULL,
    observed_at  TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    position     INTEGER NOT NULL,
    record_json  TEXT NOT NULL,
    PRIMARY KEY (entity_key, observed_at, content_hash)
);
CREATE TABLE IF NOT EXISTS window_state (
    product    TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    run_id     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS analytics_products (
    product     TEXT NOT NULL,
    version     INTEGER NOT NULL,
    run_id      TEXT NOT NULL,
    computed_at TEXT NOT NULL,
    table_json  TEXT NOT NULL,
    PRIMARY KEY (product, version)
);
CREATE TABLE IF NOT EXISTS checkpoints (
    source_id     TEXT PRIMARY KEY,
    source_offset INTEGER NOT NULL,
    run_id        TEXT NOT NULL,
    committed_at  TEXT NOT NULL
);
"#;

/// SQLite-backed tier store. Each micro-batch commit is a single transaction.
pub struct SqliteTierStore {
    conn: Mutex<Connection>,
}

impl SqliteTierStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened tier store at {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PipelineError::Store(format!("sqlite connection lock poisoned: {}", e)))
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PipelineError::Store(format!("bad timestamp '{}': {}", raw, e)))
}

fn load_canonical_row(conn: &Connection, key: &EntityKey) -> Result<Option<CanonicalRecord>> {
    let current: Option<String> = conn
        .query_row(
            "SELECT record_json FROM canonical_current WHERE entity_key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(current) = current else {
        return Ok(None);
    };
    let current: NormalizedRecord = serde_json::from_str(&current)?;

    let mut stmt = conn.prepare(
        "SELECT record_json FROM canonical_history WHERE entity_key = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![key.as_str()], |row| row.get::<_, String>(0))?;
    let mut history = Vec::new();
    for json in rows {
        let record: NormalizedRecord = serde_json::from_str(&json?)?;
        history.push(HistoryEntry::from_record(record));
    }

    Ok(Some(CanonicalRecord {
        entity_key: key.clone(),
        current,
        history,
    }))
}

#[async_trait]
impl TierStore for SqliteTierStore {
    async fn append_raw(&self, records: &[RawRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for r in records {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO raw_records
                 (record_id, source_id, source_partition, source_offset, ingested_at, ingest_day, fields_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    r.record_id,
                    r.meta.source_id,
                    r.meta.source_partition,
                    r.meta.offset as i64,
                    r.meta.ingested_at.to_rfc3339(),
                    r.meta.ingested_at.format("%Y-%m-%d").to_string(),
                    serde_json::to_string(&r.fields)?,
                ],
            )?;
        }
        tx.commit()?;
        debug!("Appended {} of {} raw records", inserted, records.len());
        Ok(inserted)
    }

    async fn raw_record(&self, record_id: &str) -> Result<Option<RawRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT source_id, source_partition, source_offset, ingested_at, fields_json
                 FROM raw_records WHERE record_id = ?1",
                params![record_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((source_id, source_partition, offset, ingested_at, fields)) = row else {
            return Ok(None);
        };
        Ok(Some(RawRecord {
            record_id: record_id.to_string(),
            fields: serde_json::from_str(&fields)?,
            meta: crate::domain::IngestMetadata {
                source_id,
                ingested_at: parse_ts(&ingested_at)?,
                source_partition,
                offset: offset as u64,
            },
        }))
    }

    async fn record_verdicts(&self, verdicts: &[ValidationVerdict]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for v in verdicts {
            tx.execute(
                "INSERT OR IGNORE INTO validation_verdicts
                 (record_id, rule_name, rule_version, outcome, reason, evaluated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    v.record_id,
                    v.rule_name,
                    v.rule_version,
                    v.outcome.as_str(),
                    v.reason,
                    v.evaluated_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn verdicts_for(&self, record_id: &str) -> Result<Vec<ValidationVerdict>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT rule_name, rule_version, outcome, reason, evaluated_at
             FROM validation_verdicts WHERE record_id = ?1 ORDER BY rule_version, rule_name",
        )?;
        let rows = stmt.query_map(params![record_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut verdicts = Vec::new();
        for row in rows {
            let (rule_name, rule_version, outcome, reason, evaluated_at) = row?;
            verdicts.push(ValidationVerdict {
                record_id: record_id.to_string(),
                rule_name,
                rule_version,
                outcome: outcome.parse::<VerdictOutcome>()?,
                reason,
                evaluated_at: parse_ts(&evaluated_at)?,
            });
        }
        Ok(verdicts)
    }

    async fn quarantine(&self, entries: &[QuarantineEntry]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for e in entries {
            tx.execute(
                "INSERT OR IGNORE INTO quarantine (record_id, entry_json, quarantined_at) VALUES (?1, ?2, ?3)",
                params![
                    e.record.record_id,
                    serde_json::to_string(e)?,
                    e.quarantined_at.to_rfc3339()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_quarantine(&self) -> Result<Vec<QuarantineEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT entry_json FROM quarantine ORDER BY quarantined_at, record_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut entries = Vec::new();
        for json in rows {
            entries.push(serde_json::from_str(&json?)?);
        }
        Ok(entries)
    }

    async fn quarantine_entry(&self, record_id: &str) -> Result<Option<QuarantineEntry>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT entry_json FROM quarantine WHERE record_id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(PipelineError::from))
            .transpose()
    }

    async fn set_quarantine_status(&self, record_id: &str, status: QuarantineStatus) -> Result<()> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT entry_json FROM quarantine WHERE record_id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()?;
        let mut entry: QuarantineEntry = match json {
            Some(j) => serde_json::from_str(&j)?,
            None => {
                return Err(PipelineError::Store(format!(
                    "record {} is not in quarantine",
                    record_id
                )))
            }
        };
        entry.status = status;
        conn.execute(
            "UPDATE quarantine SET entry_json = ?2 WHERE record_id = ?1",
            params![record_id, serde_json::to_string(&entry)?],
        )?;
        Ok(())
    }

    async fn load_canonical(&self, keys: &[EntityKey]) -> Result<HashMap<EntityKey, CanonicalRecord>> {
        let conn = self.lock()?;
        let mut found = HashMap::new();
        for key in keys {
            if let Some(record) = load_canonical_row(&conn, key)? {
                found.insert(key.clone(), record);
            }
        }
        Ok(found)
    }

    async fn canonical_snapshot(&self) -> Result<BTreeMap<EntityKey, CanonicalRecord>> {
        let conn = self.lock()?;
        let keys: Vec<String> = {
            let mut stmt = conn.prepare("SELECT entity_key FROM canonical_current ORDER BY entity_key")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        let mut snapshot = BTreeMap::new();
        for key in keys {
            let key = EntityKey(key);
            if let Some(record) = load_canonical_row(&conn, &key)? {
                snapshot.insert(key, record);
            }
        }
        Ok(snapshot)
    }

    async fn window_states(&self) -> Result<HashMap<String, WindowState>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT product, state_json FROM window_state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut states = HashMap::new();
        for row in rows {
            let (product, json) = row?;
            states.insert(product, serde_json::from_str(&json)?);
        }
        Ok(states)
    }

    async fn latest_product(&self, name: &str) -> Result<Option<ProductTable>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT table_json FROM analytics_products WHERE product = ?1 ORDER BY version DESC LIMIT 1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(PipelineError::from))
            .transpose()
    }

    async fn product_versions(&self, name: &str) -> Result<Vec<ProductTable>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT table_json FROM analytics_products WHERE product = ?1 ORDER BY version ASC")?;
        let rows = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
        let mut tables = Vec::new();
        for json in rows {
            tables.push(serde_json::from_str(&json?)?);
        }
        Ok(tables)
    }

    async fn product_names(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT product FROM analytics_products ORDER BY product")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    async fn checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT source_offset, run_id, committed_at FROM checkpoints WHERE source_id = ?1",
                params![source_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(offset, run_id, committed_at)| -> Result<Checkpoint> {
            Ok(Checkpoint {
                source_id: source_id.to_string(),
                offset: offset as u64,
                run_id,
                committed_at: parse_ts(&committed_at)?,
            })
        })
        .transpose()
    }

    async fn commit(&self, commit: BatchCommit) -> Result<CommitReceipt> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut receipt = CommitReceipt::default();

        for record in &commit.canonical {
            tx.execute(
                "INSERT INTO canonical_current (entity_key, observed_at, record_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_key) DO UPDATE SET observed_at=excluded.observed_at, record_json=excluded.record_json",
                params![
                    record.entity_key.as_str(),
                    record.current.observed_at.to_rfc3339(),
                    serde_json::to_string(&record.current)?,
                ],
            )?;
            for (position, entry) in record.history.iter().enumerate() {
                tx.execute(
                    "INSERT OR REPLACE INTO canonical_history
                     (entity_key, observed_at, content_hash, position, record_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.entity_key.as_str(),
                        entry.observed_at.to_rfc3339(),
                        entry.content_hash,
                        position as i64,
                        serde_json::to_string(&entry.record)?,
                    ],
                )?;
            }
        }

        for (product, state) in &commit.window_states {
            tx.execute(
                "INSERT INTO window_state (product, state_json, run_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(product) DO UPDATE SET state_json=excluded.state_json, run_id=excluded.run_id",
                params![product, serde_json::to_string(state)?, commit.run_id],
            )?;
        }

        for table in &commit.products {
            let version: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM analytics_products WHERE product = ?1",
                params![table.product],
                |row| row.get(0),
            )?;
            let mut table = table.clone();
            table.version = version as u64;
            tx.execute(
                "INSERT INTO analytics_products (product, version, run_id, computed_at, table_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    table.product,
                    version,
                    table.run_id,
                    table.computed_at.to_rfc3339(),
                    serde_json::to_string(&table)?,
                ],
            )?;
            receipt.product_versions.insert(table.product.clone(), table.version);
        }

        if let Some(cp) = &commit.checkpoint {
            tx.execute(
                "INSERT INTO checkpoints (source_id, source_offset, run_id, committed_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_id) DO UPDATE SET source_offset=excluded.source_offset,
                     run_id=excluded.run_id, committed_at=excluded.committed_at",
                params![cp.source_id, cp.offset as i64, cp.run_id, cp.committed_at.to_rfc3339()],
            )?;
        }

        tx.commit()?;
        debug!(
            "Committed run {}: {} entities, {} products",
            commit.run_id,
            commit.canonical.len(),
            receipt.product_versions.len()
        );
        Ok(receipt)
    }
}
