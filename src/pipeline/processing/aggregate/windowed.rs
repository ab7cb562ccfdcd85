//! Windowed products: partial aggregates keyed by (window, group), folded incrementally.
//!
//! Late data is anything landing in a window that ends at or before the watermark
//! (max observed time minus the allowed lateness). Under [`LatePolicy::Reopen`] it is folded
//! into the window and the window's revision is bumped; under [`LatePolicy::Correction`] it is
//! kept in a separate correction aggregate emitted as its own flagged row.
//!
//! Observations from a run whose fold failed are parked in the state as a backlog and folded
//! first on the next run, so a failed micro-batch delays its records instead of losing them.

use chrono::{DateTime, Datelike, Duration, DurationRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::measures::{empty_partials, fold_record, MeasureSpec, Partial};
use crate::constants::{COL_CORRECTION, COL_ENTITY_KEY, COL_REVISION, COL_WINDOW_END, COL_WINDOW_START, ENTITY_KEY_GROUP};
use crate::domain::NormalizedRecord;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowSpec {
    Minutes(u32),
    Hour,
    Day,
    Month,
}

impl WindowSpec {
    /// Half-open `[start, end)` window containing `ts`
    pub fn bounds(&self, ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            WindowSpec::Minutes(n) => {
                let width = i64::from((*n).max(1)) * 60;
                let start_secs = ts.timestamp().div_euclid(width) * width;
                let start = Utc.timestamp_opt(start_secs, 0).single().unwrap_or(ts);
                (start, start + Duration::seconds(width))
            }
            WindowSpec::Hour => {
                let start = ts.duration_trunc(Duration::hours(1)).unwrap_or(ts);
                (start, start + Duration::hours(1))
            }
            WindowSpec::Day => {
                let start = ts.duration_trunc(Duration::days(1)).unwrap_or(ts);
                (start, start + Duration::days(1))
            }
            WindowSpec::Month => {
                let start = month_start(ts.year(), ts.month()).unwrap_or(ts);
                let (y, m) = if ts.month() == 12 {
                    (ts.year() + 1, 1)
                } else {
                    (ts.year(), ts.month() + 1)
                };
                (start, month_start(y, m).unwrap_or(start))
            }
        }
    }
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Fold only observations that are new in this run
    #[default]
    Incremental,
    /// Recompute from the complete canonical history
    Full,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    #[default]
    Reopen,
    Correction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowFilter {
    pub field: String,
    pub values: Vec<String>,
}

impl RowFilter {
    pub fn matches(&self, record: &NormalizedRecord) -> bool {
        let label = record.field(&self.field).group_label();
        self.values.iter().any(|v| v.eq_ignore_ascii_case(&label))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowedSpec {
    pub window: WindowSpec,
    /// Grouping fields; `@entity_key` groups by entity
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub filter: Option<RowFilter>,
    pub measures: Vec<MeasureSpec>,
    #[serde(default)]
    pub refresh: RefreshMode,
    #[serde(default)]
    pub allowed_lateness_secs: i64,
    #[serde(default)]
    pub late_policy: LatePolicy,
    /// Finalized windows ending this long before the watermark are dropped from the state
    #[serde(default)]
    pub retention_secs: Option<i64>,
}

impl WindowedSpec {
    fn group_labels(&self, record: &NormalizedRecord) -> Vec<String> {
        self.group_by
            .iter()
            .map(|g| {
                if g == ENTITY_KEY_GROUP {
                    record.entity_key.to_string()
                } else {
                    record.field(g).group_label()
                }
            })
            .collect()
    }

    pub fn columns(&self) -> Vec<String> {
        let mut columns = vec![COL_WINDOW_START.to_string(), COL_WINDOW_END.to_string()];
        columns.extend(self.group_by.iter().map(|g| {
            if g == ENTITY_KEY_GROUP {
                COL_ENTITY_KEY.to_string()
            } else {
                g.clone()
            }
        }));
        columns.extend(self.measures.iter().map(|m| m.name.clone()));
        columns.push(COL_REVISION.to_string());
        columns.push(COL_CORRECTION.to_string());
        columns
    }
}

/// Persisted partial aggregate for one (window, group)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowCell {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub group: Vec<String>,
    pub partials: Vec<Partial>,
    /// Bumped each run in which late data reopened this window
    pub revision: u32,
    pub finalized: bool,
    #[serde(default)]
    pub correction: Option<Vec<Partial>>,
}

/// Everything a windowed product carries from one run to the next
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WindowState {
    pub max_observed: Option<DateTime<Utc>>,
    pub watermark: Option<DateTime<Utc>>,
    pub cells: Vec<WindowCell>,
    /// Observations of failed runs, waiting to be folded
    #[serde(default)]
    pub pending: Vec<NormalizedRecord>,
    /// Backlog observations that failed again on their own and were set aside
    #[serde(default)]
    pub rejected: Vec<RejectedObservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedObservation {
    pub record_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub folded: usize,
    pub late: usize,
    pub windows_reopened: usize,
    /// Backlog observations set aside in this fold
    pub rejected: usize,
    pub windows_evicted: usize,
}

type CellKey = (DateTime<Utc>, Vec<String>);

/// Fold observations into a copy of `state`. The input state is untouched, so a failed fold
/// leaves the stored state exactly as it was.
pub fn fold(
    spec: &WindowedSpec,
    state: &WindowState,
    observations: &[&NormalizedRecord],
) -> Result<(WindowState, FoldStats), String> {
    let mut cells: BTreeMap<CellKey, WindowCell> = state
        .cells
        .iter()
        .map(|c| ((c.window_start, c.group.clone()), c.clone()))
        .collect();
    let mut reopened: BTreeSet<CellKey> = BTreeSet::new();
    let mut stats = FoldStats::default();

    for record in observations {
        if let Some(filter) = &spec.filter {
            if !filter.matches(record) {
                continue;
            }
        }
        let (start, end) = spec.window.bounds(record.observed_at);
        let key = (start, spec.group_labels(record));
        let late = state.watermark.map_or(false, |w| end <= w);
        let cell = cells.entry(key.clone()).or_insert_with(|| WindowCell {
            window_start: start,
            window_end: end,
            group: key.1.clone(),
            partials: empty_partials(&spec.measures),
            revision: 0,
            finalized: false,
            correction: None,
        });

        stats.folded += 1;
        if late {
            stats.late += 1;
            match spec.late_policy {
                LatePolicy::Reopen => {
                    fold_record(&mut cell.partials, &spec.measures, record)?;
                    reopened.insert(key);
                }
                LatePolicy::Correction => {
                    let correction = cell
                        .correction
                        .get_or_insert_with(|| empty_partials(&spec.measures));
                    fold_record(correction, &spec.measures, record)?;
                }
            }
        } else {
            fold_record(&mut cell.partials, &spec.measures, record)?;
        }
    }

    for key in &reopened {
        if let Some(cell) = cells.get_mut(key) {
            cell.revision += 1;
            cell.finalized = false;
        }
    }
    stats.windows_reopened = reopened.len();

    let max_observed = observations
        .iter()
        .map(|r| r.observed_at)
        .chain(state.max_observed)
        .max();
    let lateness = Duration::seconds(spec.allowed_lateness_secs.max(0));
    let watermark = match (max_observed.map(|m| m - lateness), state.watermark) {
        (Some(new), Some(old)) => Some(new.max(old)),
        (new, old) => new.or(old),
    };
    if let Some(w) = watermark {
        for cell in cells.values_mut() {
            if cell.window_end <= w {
                cell.finalized = true;
            }
        }
        if let Some(retention) = spec.retention_secs {
            let horizon = w - Duration::seconds(retention.max(0));
            let before = cells.len();
            cells.retain(|_, cell| !(cell.finalized && cell.window_end <= horizon));
            stats.windows_evicted = before - cells.len();
        }
    }

    Ok((
        WindowState {
            max_observed,
            watermark,
            cells: cells.into_values().collect(),
            pending: Vec::new(),
            rejected: state.rejected.clone(),
        },
        stats,
    ))
}

/// Fold the backlog left by failed runs, then this run's observations. Each backlog record is
/// first tried on its own; one that still fails is moved to `rejected` so it cannot block the
/// product again.
pub fn fold_with_backlog(
    spec: &WindowedSpec,
    state: &WindowState,
    observations: &[&NormalizedRecord],
) -> Result<(WindowState, FoldStats), String> {
    if state.pending.is_empty() {
        return fold(spec, state, observations);
    }

    let mut rejected = state.rejected.clone();
    let mut replayable: Vec<&NormalizedRecord> = Vec::with_capacity(state.pending.len() + observations.len());
    for record in &state.pending {
        match fold(spec, &WindowState::default(), &[record]) {
            Ok(_) => replayable.push(record),
            Err(reason) => {
                tracing::warn!(record_id = %record.record_id, %reason, "backlog observation set aside");
                rejected.push(RejectedObservation {
                    record_id: record.record_id.clone(),
                    reason,
                });
            }
        }
    }
    let set_aside = rejected.len() - state.rejected.len();
    replayable.extend_from_slice(observations);

    let base = WindowState {
        max_observed: state.max_observed,
        watermark: state.watermark,
        cells: state.cells.clone(),
        pending: Vec::new(),
        rejected,
    };
    let (next, mut stats) = fold(spec, &base, &replayable)?;
    stats.rejected = set_aside;
    Ok((next, stats))
}

/// State to persist when a fold failed: unchanged aggregates, plus this run's observations
/// queued behind any existing backlog
pub fn defer(spec: &WindowedSpec, state: &WindowState, observations: &[NormalizedRecord]) -> WindowState {
    let mut deferred = state.clone();
    deferred.pending.extend(
        observations
            .iter()
            .filter(|r| spec.filter.as_ref().map_or(true, |f| f.matches(r)))
            .cloned(),
    );
    deferred
}

/// Render the state as table rows aligned with [`WindowedSpec::columns`]
pub fn rows(state: &WindowState) -> Vec<Vec<Value>> {
    let mut rows = Vec::with_capacity(state.cells.len());
    for cell in &state.cells {
        let prefix = || {
            let mut row = vec![
                Value::String(cell.window_start.to_rfc3339()),
                Value::String(cell.window_end.to_rfc3339()),
            ];
            row.extend(cell.group.iter().cloned().map(Value::String));
            row
        };

        let mut row = prefix();
        row.extend(cell.partials.iter().map(Partial::finalize));
        row.push(Value::from(cell.revision));
        row.push(Value::Bool(false));
        rows.push(row);

        if let Some(correction) = &cell.correction {
            let mut row = prefix();
            row.extend(correction.iter().map(Partial::finalize));
            row.push(Value::from(cell.revision));
            row.push(Value::Bool(true));
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityKey, FieldValue};
    use crate::pipeline::processing::aggregate::measures::MeasureOp;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap as Map;

    fn event(id: usize, at: DateTime<Utc>, kind: &str, amount: i64) -> NormalizedRecord {
        let key = EntityKey::new(format!("evt-{}", id));
        let mut fields = Map::new();
        fields.insert("event_type".to_string(), FieldValue::Text(kind.to_string()));
        fields.insert("amount".to_string(), FieldValue::Number(Decimal::from(amount)));
        NormalizedRecord {
            record_id: format!("r{}", id),
            content_hash: NormalizedRecord::compute_content_hash(&key, &fields),
            entity_key: key,
            observed_at: at,
            ingested_at: at,
            source_id: "stream".into(),
            fields,
            coerced: Default::default(),
            degraded: Default::default(),
            warnings: vec![],
        }
    }

    fn daily_revenue(policy: LatePolicy) -> WindowedSpec {
        WindowedSpec {
            window: WindowSpec::Day,
            group_by: vec![],
            filter: Some(RowFilter {
                field: "event_type".into(),
                values: vec!["purchase".into()],
            }),
            measures: vec![
                MeasureSpec { name: "events".into(), op: MeasureOp::Count },
                MeasureSpec { name: "revenue".into(), op: MeasureOp::Sum { field: "amount".into() } },
            ],
            refresh: RefreshMode::Incremental,
            allowed_lateness_secs: 3600,
            late_policy: policy,
            retention_secs: None,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_window_bounds() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 31, 13, 7, 42).unwrap();
        assert_eq!(WindowSpec::Minutes(5).bounds(ts).0, Utc.with_ymd_and_hms(2024, 12, 31, 13, 5, 0).unwrap());
        assert_eq!(WindowSpec::Hour.bounds(ts).0, Utc.with_ymd_and_hms(2024, 12, 31, 13, 0, 0).unwrap());
        assert_eq!(WindowSpec::Day.bounds(ts).1, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(
            WindowSpec::Month.bounds(ts),
            (
                Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
            )
        );
    }

    #[test]
    fn test_today_accumulates_across_micro_batches() {
        let spec = daily_revenue(LatePolicy::Reopen);
        let first: Vec<_> = (0..2).map(|i| event(i, at(5, 9), "purchase", 50)).collect();
        let mut second: Vec<_> = (2..12).map(|i| event(i, at(5, 10), "purchase", 50)).collect();
        second.push(event(99, at(5, 10), "view", 1000));

        let (state, _) = fold(&spec, &WindowState::default(), &first.iter().collect::<Vec<_>>()).unwrap();
        assert_eq!(rows(&state)[0][2..4], [Value::from(2u64), Value::from(100)]);

        let (state, _) = fold(&spec, &state, &second.iter().collect::<Vec<_>>()).unwrap();
        let table = rows(&state);
        assert_eq!(table.len(), 1);
        assert_eq!(table[0][2..4], [Value::from(12u64), Value::from(600)]);
    }

    #[test]
    fn test_any_partition_and_order_converges() {
        let spec = daily_revenue(LatePolicy::Reopen);
        let events: Vec<_> = (0..30)
            .map(|i| event(i, at(1 + (i % 4) as u32, (i % 24) as u32), "purchase", i as i64 + 1))
            .collect();

        let (all_at_once, _) = fold(&spec, &WindowState::default(), &events.iter().collect::<Vec<_>>()).unwrap();

        let mut reversed: Vec<&NormalizedRecord> = events.iter().collect();
        reversed.reverse();
        let mut state = WindowState::default();
        for chunk in reversed.chunks(7) {
            state = fold(&spec, &state, chunk).unwrap().0;
        }

        let measures = |s: &WindowState| -> Vec<(DateTime<Utc>, Vec<Partial>)> {
            s.cells.iter().map(|c| (c.window_start, c.partials.clone())).collect()
        };
        assert_eq!(measures(&all_at_once), measures(&state));
    }

    #[test]
    fn test_late_data_reopens_finalized_window() {
        let spec = daily_revenue(LatePolicy::Reopen);
        let day1 = [event(1, at(1, 12), "purchase", 10)];
        let day3 = [event(2, at(3, 12), "purchase", 10)];
        let late = [event(3, at(1, 18), "purchase", 5)];

        let (s, _) = fold(&spec, &WindowState::default(), &day1.iter().collect::<Vec<_>>()).unwrap();
        let (s, _) = fold(&spec, &s, &day3.iter().collect::<Vec<_>>()).unwrap();
        assert!(s.cells[0].finalized);

        let (s, stats) = fold(&spec, &s, &late.iter().collect::<Vec<_>>()).unwrap();
        assert_eq!(stats.late, 1);
        assert_eq!(stats.windows_reopened, 1);
        let table = rows(&s);
        assert_eq!(table[0][3], Value::from(15));
        assert_eq!(table[0][4], Value::from(1u32));
        assert!(s.cells[0].finalized);
    }

    #[test]
    fn test_late_data_routed_to_correction_row() {
        let spec = daily_revenue(LatePolicy::Correction);
        let day1 = [event(1, at(1, 12), "purchase", 10)];
        let day3 = [event(2, at(3, 12), "purchase", 10)];
        let late = [event(3, at(1, 18), "purchase", 5)];

        let (s, _) = fold(&spec, &WindowState::default(), &day1.iter().collect::<Vec<_>>()).unwrap();
        let (s, _) = fold(&spec, &s, &day3.iter().collect::<Vec<_>>()).unwrap();
        let (s, _) = fold(&spec, &s, &late.iter().collect::<Vec<_>>()).unwrap();

        let table = rows(&s);
        assert_eq!(table.len(), 3);
        assert_eq!(table[0][3], Value::from(10));
        assert_eq!(table[0][5], Value::Bool(false));
        assert_eq!(table[1][3], Value::from(5));
        assert_eq!(table[1][5], Value::Bool(true));
        assert_eq!(table[1][4], Value::from(0u32));
    }

    #[test]
    fn test_failed_fold_leaves_state_untouched() {
        let mut spec = daily_revenue(LatePolicy::Reopen);
        spec.measures.push(MeasureSpec {
            name: "bogus".into(),
            op: MeasureOp::Sum { field: "event_type".into() },
        });
        let state = WindowState::default();
        let batch = [event(1, at(1, 1), "purchase", 1)];
        assert!(fold(&spec, &state, &batch.iter().collect::<Vec<_>>()).is_err());
        assert_eq!(state, WindowState::default());
    }

    fn bogus_amount(id: usize, at: DateTime<Utc>) -> NormalizedRecord {
        let mut record = event(id, at, "purchase", 0);
        record.fields.insert("amount".to_string(), FieldValue::Text("vip".into()));
        record
    }

    #[test]
    fn test_backlog_from_failed_run_is_folded_next_time() {
        let spec = daily_revenue(LatePolicy::Reopen);
        let first = [event(1, at(2, 9), "purchase", 10), event(2, at(2, 9), "purchase", 10)];
        let second = vec![event(3, at(2, 10), "purchase", 10), bogus_amount(4, at(2, 10))];
        let third = [event(5, at(2, 11), "purchase", 10)];

        let (state, _) = fold(&spec, &WindowState::default(), &first.iter().collect::<Vec<_>>()).unwrap();
        assert!(fold_with_backlog(&spec, &state, &second.iter().collect::<Vec<_>>()).is_err());

        let deferred = defer(&spec, &state, &second);
        assert_eq!(deferred.cells, state.cells);
        assert_eq!(deferred.pending.len(), 2);

        let (state, stats) = fold_with_backlog(&spec, &deferred, &third.iter().collect::<Vec<_>>()).unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(rows(&state)[0][2..4], [Value::from(4u64), Value::from(40)]);
        assert!(state.pending.is_empty());
        assert_eq!(state.rejected.len(), 1);
        assert_eq!(state.rejected[0].record_id, "r4");
        assert!(state.rejected[0].reason.contains("measure 'revenue'"));
    }

    #[test]
    fn test_defer_skips_filtered_out_observations() {
        let spec = daily_revenue(LatePolicy::Reopen);
        let batch = vec![event(1, at(2, 9), "view", 0), event(2, at(2, 9), "purchase", 5)];
        let deferred = defer(&spec, &WindowState::default(), &batch);
        assert_eq!(deferred.pending.len(), 1);
        assert_eq!(deferred.pending[0].record_id, "r2");
    }

    #[test]
    fn test_retention_evicts_old_finalized_windows() {
        let mut spec = daily_revenue(LatePolicy::Reopen);
        spec.retention_secs = Some(86_400);
        let days: Vec<_> = (1..=4).map(|d| event(d as usize, at(d, 12), "purchase", 1)).collect();

        let mut state = WindowState::default();
        let mut evicted = 0;
        for day in &days {
            let (next, stats) = fold(&spec, &state, &[day]).unwrap();
            evicted += stats.windows_evicted;
            state = next;
        }
        // watermark 4th 11:00, horizon 3rd 11:00: the 1st and 2nd are gone, the finalized 3rd is kept
        assert_eq!(evicted, 2);
        let starts: Vec<_> = state.cells.iter().map(|c| c.window_start).collect();
        assert_eq!(starts, vec![at(3, 0), at(4, 0)]);
    }
}
