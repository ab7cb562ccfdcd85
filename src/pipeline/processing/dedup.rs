//! Deduplication: one authoritative current observation per entity key, plus a complete,
//! timestamp-ordered history.
//!
//! Candidates are ranked by a total order (observed_at, ingested_at, source priority, record id),
//! so the winner never depends on arrival order or batch partitioning.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::{CanonicalRecord, EntityKey, HistoryEntry, NormalizedRecord};
use crate::error::{PipelineError, Result};
use crate::idempotency::shard_for;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Tie-breaker between sources; higher wins. Unlisted sources rank 0.
    #[serde(default)]
    pub source_priority: BTreeMap<String, i64>,
}

/// What a resolution did to one entity key
#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    pub canonical: CanonicalRecord,
    /// History entries that did not exist before this resolution, ascending
    pub new_entries: Vec<HistoryEntry>,
    pub changed_current: bool,
    pub duplicates_collapsed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DedupEngine {
    source_priority: HashMap<String, i64>,
}

impl DedupEngine {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            source_priority: config
                .source_priority
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    fn priority(&self, source_id: &str) -> i64 {
        self.source_priority.get(source_id).copied().unwrap_or(0)
    }

    /// Total order over observations; `Greater` means "more authoritative"
    pub fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> Ordering {
        a.observed_at
            .cmp(&b.observed_at)
            .then(a.ingested_at.cmp(&b.ingested_at))
            .then(self.priority(&a.source_id).cmp(&self.priority(&b.source_id)))
            .then(a.record_id.cmp(&b.record_id))
    }

    /// Merge this run's candidates for `key` into its prior canonical state
    pub fn resolve(
        &self,
        key: &EntityKey,
        prior: Option<&CanonicalRecord>,
        mut candidates: Vec<NormalizedRecord>,
    ) -> Result<DedupOutcome> {
        if let Some(stray) = candidates.iter().find(|c| &c.entity_key != key) {
            return Err(PipelineError::DeduplicationConflict {
                entity_key: key.to_string(),
                detail: format!("candidate {} belongs to entity {}", stray.record_id, stray.entity_key),
            });
        }

        let mut history: Vec<HistoryEntry> = prior.map(|p| p.history.clone()).unwrap_or_default();
        let mut added: HashSet<(i64, String)> = HashSet::new();
        let mut duplicates_collapsed = 0;

        candidates.sort_by(|a, b| self.compare(a, b));
        for candidate in candidates {
            if let Some(existing) = history
                .iter_mut()
                .find(|e| e.observed_at == candidate.observed_at && e.content_hash == candidate.content_hash)
            {
                if existing.record.record_id == candidate.record_id {
                    // replay of an observation we already hold
                    continue;
                }
                duplicates_collapsed += 1;
                if self.compare(&candidate, &existing.record) == Ordering::Greater {
                    existing.record = candidate;
                }
                continue;
            }

            if let Some(clash) = history
                .iter()
                .find(|e| self.compare(&e.record, &candidate) == Ordering::Equal)
            {
                return Err(PipelineError::DeduplicationConflict {
                    entity_key: key.to_string(),
                    detail: format!(
                        "record {} orders equal to a held observation but content differs ({} vs {})",
                        candidate.record_id, clash.content_hash, candidate.content_hash
                    ),
                });
            }

            added.insert((candidate.observed_at.timestamp_micros(), candidate.content_hash.clone()));
            history.push(HistoryEntry::from_record(candidate));
        }

        history.sort_by(|a, b| self.compare(&a.record, &b.record));

        let current = history
            .iter()
            .max_by(|a, b| self.compare(&a.record, &b.record))
            .map(|e| e.record.clone())
            .ok_or_else(|| PipelineError::DeduplicationConflict {
                entity_key: key.to_string(),
                detail: "no observations to resolve".to_string(),
            })?;

        let changed_current = prior.map_or(true, |p| p.current.record_id != current.record_id);
        let new_entries = history
            .iter()
            .filter(|e| added.contains(&(e.observed_at.timestamp_micros(), e.content_hash.clone())))
            .cloned()
            .collect();

        Ok(DedupOutcome {
            canonical: CanonicalRecord {
                entity_key: key.clone(),
                current,
                history,
            },
            new_entries,
            changed_current,
            duplicates_collapsed,
        })
    }

    /// Resolve many keys at once. Keys are spread over `shards` by a stable hash and the shards
    /// run in parallel; a key never spans two shards. Results come back in key order.
    pub fn resolve_sharded(
        &self,
        groups: BTreeMap<EntityKey, Vec<NormalizedRecord>>,
        prior: &HashMap<EntityKey, CanonicalRecord>,
        shards: usize,
    ) -> Vec<(EntityKey, Result<DedupOutcome>)> {
        let shards = shards.max(1);
        let mut partitions: Vec<Vec<(EntityKey, Vec<NormalizedRecord>)>> = vec![Vec::new(); shards];
        for (key, records) in groups {
            partitions[shard_for(key.as_str(), shards)].push((key, records));
        }

        let mut resolved: Vec<(EntityKey, Result<DedupOutcome>)> = partitions
            .into_par_iter()
            .flat_map_iter(|partition| {
                partition.into_iter().map(|(key, records)| {
                    let outcome = self.resolve(&key, prior.get(&key), records);
                    (key, outcome)
                })
            })
            .collect();
        resolved.sort_by(|a, b| a.0.cmp(&b.0));
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldValue;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;

    fn ts(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, month, day, 0, 0, 0).unwrap()
    }

    fn obs(id: &str, observed: DateTime<Utc>, ingested: DateTime<Utc>, income: i64) -> NormalizedRecord {
        let key = EntityKey::new("C1");
        let mut fields = BTreeMap::new();
        fields.insert("annual_income".to_string(), FieldValue::Number(Decimal::from(income)));
        fields.insert("observed_at".to_string(), FieldValue::Timestamp(observed));
        NormalizedRecord {
            record_id: id.to_string(),
            content_hash: NormalizedRecord::compute_content_hash(&key, &fields),
            entity_key: key,
            observed_at: observed,
            ingested_at: ingested,
            source_id: "core".into(),
            fields,
            coerced: Default::default(),
            degraded: Default::default(),
            warnings: vec![],
        }
    }

    #[test]
    fn test_late_arriving_older_observation_does_not_win() {
        let engine = DedupEngine::default();
        let key = EntityKey::new("C1");
        let newer = obs("r1", ts(2, 1), ts(2, 2), 52_000);
        let older = obs("r2", ts(1, 1), ts(2, 3), 48_000);

        let first = engine.resolve(&key, None, vec![newer.clone()]).unwrap();
        let second = engine.resolve(&key, Some(&first.canonical), vec![older]).unwrap();

        assert_eq!(
            second.canonical.current.field("annual_income"),
            &FieldValue::Number(Decimal::from(52_000))
        );
        assert!(!second.changed_current);
        let incomes: Vec<_> = second
            .canonical
            .history
            .iter()
            .map(|e| e.record.field("annual_income").clone())
            .collect();
        assert_eq!(
            incomes,
            vec![
                FieldValue::Number(Decimal::from(48_000)),
                FieldValue::Number(Decimal::from(52_000))
            ]
        );
        assert_eq!(second.new_entries.len(), 1);
    }

    #[test]
    fn test_winner_independent_of_arrival_order_and_batching() {
        let engine = DedupEngine::default();
        let key = EntityKey::new("C1");
        let records = vec![
            obs("a", ts(1, 5), ts(1, 6), 1),
            obs("b", ts(1, 5), ts(1, 7), 2),
            obs("c", ts(1, 3), ts(1, 9), 3),
            obs("d", ts(1, 4), ts(1, 4), 4),
        ];

        let all_at_once = engine.resolve(&key, None, records.clone()).unwrap().canonical;
        let mut reversed = records.clone();
        reversed.reverse();
        let reversed = engine.resolve(&key, None, reversed).unwrap().canonical;

        let mut incremental: Option<CanonicalRecord> = None;
        for r in [&records[2], &records[1], &records[3], &records[0]] {
            incremental = Some(
                engine
                    .resolve(&key, incremental.as_ref(), vec![r.clone()])
                    .unwrap()
                    .canonical,
            );
        }

        assert_eq!(all_at_once.current.record_id, "b");
        assert_eq!(all_at_once, reversed);
        assert_eq!(Some(all_at_once), incremental);
    }

    #[test]
    fn test_exact_duplicates_collapse_and_replays_are_noops() {
        let engine = DedupEngine::default();
        let key = EntityKey::new("C1");
        let a = obs("a", ts(1, 1), ts(1, 2), 10);
        let mut dup = obs("z", ts(1, 1), ts(1, 3), 10);
        dup.content_hash = a.content_hash.clone();

        let out = engine.resolve(&key, None, vec![a.clone(), dup]).unwrap();
        assert_eq!(out.canonical.history.len(), 1);
        assert_eq!(out.duplicates_collapsed, 1);
        assert_eq!(out.canonical.current.record_id, "z");

        let replay = engine.resolve(&key, Some(&out.canonical), vec![a]).unwrap();
        assert_eq!(replay.canonical, out.canonical);
        assert!(replay.new_entries.is_empty());
        assert_eq!(replay.duplicates_collapsed, 1);
    }

    #[test]
    fn test_equal_order_with_different_content_is_a_conflict() {
        let engine = DedupEngine::default();
        let key = EntityKey::new("C1");
        let a = obs("same", ts(1, 1), ts(1, 1), 10);
        let b = obs("same", ts(1, 1), ts(1, 1), 11);
        let err = engine.resolve(&key, None, vec![a, b]).unwrap_err();
        assert!(matches!(err, PipelineError::DeduplicationConflict { .. }));
    }

    #[test]
    fn test_source_priority_breaks_ties() {
        let mut config = DedupConfig::default();
        config.source_priority.insert("bureau".into(), 10);
        let engine = DedupEngine::new(&config);
        let key = EntityKey::new("C1");
        let core = obs("zzz", ts(1, 1), ts(1, 1), 1);
        let mut bureau = obs("aaa", ts(1, 1), ts(1, 1), 2);
        bureau.source_id = "bureau".into();
        let out = engine.resolve(&key, None, vec![core, bureau]).unwrap();
        assert_eq!(out.canonical.current.record_id, "aaa");
    }

    #[test]
    fn test_sharded_resolution_matches_sequential() {
        let engine = DedupEngine::default();
        let mut groups = BTreeMap::new();
        for i in 0..20 {
            let key = EntityKey::new(format!("K{}", i));
            let mut r = obs(&format!("r{}", i), ts(1, 1 + (i % 5) as u32), ts(1, 10), i);
            r.entity_key = key.clone();
            groups.insert(key, vec![r]);
        }
        let parallel = engine.resolve_sharded(groups.clone(), &HashMap::new(), 4);
        let sequential = engine.resolve_sharded(groups, &HashMap::new(), 1);
        assert_eq!(parallel.len(), 20);
        for ((ka, a), (kb, b)) in parallel.iter().zip(sequential.iter()) {
            assert_eq!(ka, kb);
            assert_eq!(a.as_ref().unwrap(), b.as_ref().unwrap());
        }
    }
}
