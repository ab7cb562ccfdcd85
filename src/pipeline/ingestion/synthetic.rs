//! Synthetic click-stream source, modelled on a `rate`-style streaming generator: a fixed
//! number of rows per tick with random users, sessions, event types and amounts.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};

use super::{IngestBatch, IngestionAdapter};
use crate::domain::{IngestMetadata, RawRecord};
use crate::error::Result;

const EVENT_TYPES: [&str; 6] = ["click", "view", "purchase", "add_to_cart", "search", "logout"];
const DEVICES: [&str; 3] = ["mobile", "desktop", "tablet"];
const COUNTRIES: [&str; 7] = ["US", "UK", "CA", "DE", "FR", "IN", "AU"];
const BROWSERS: [&str; 4] = ["Chrome", "Firefox", "Safari", "Edge"];
const REFERRERS: [&str; 5] = ["google", "facebook", "direct", "email", "instagram"];

pub struct SyntheticEventAdapter {
    source_id: String,
    rng: StdRng,
    rows_per_batch: usize,
    batches_remaining: Option<u64>,
    clock: DateTime<Utc>,
    tick: Duration,
    next_offset: u64,
    skip_through: u64,
    late_fraction: f64,
    max_delay_secs: i64,
}

impl SyntheticEventAdapter {
    /// `rows_per_batch` events per micro-batch; `batches` bounds the number of batches emitted
    /// after any resume point (None = unbounded)
    pub fn new(source_id: impl Into<String>, rows_per_batch: usize, batches: Option<u64>, seed: u64) -> Self {
        Self {
            source_id: source_id.into(),
            rng: StdRng::seed_from_u64(seed),
            rows_per_batch: rows_per_batch.max(1),
            batches_remaining: batches,
            clock: Utc::now(),
            tick: Duration::milliseconds(100),
            next_offset: 1,
            skip_through: 0,
            late_fraction: 0.0,
            max_delay_secs: 0,
        }
    }

    /// Event time of the first generated row; later rows advance by one tick each
    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.clock = start;
        self
    }

    /// Emit a fraction of events with timestamps pushed back by up to `max_delay_secs`
    pub fn with_late_events(mut self, fraction: f64, max_delay_secs: i64) -> Self {
        self.late_fraction = fraction.clamp(0.0, 1.0);
        self.max_delay_secs = max_delay_secs.max(0);
        self
    }

    fn pick(&mut self, options: &[&'static str]) -> &'static str {
        options.choose(&mut self.rng).copied().unwrap_or_default()
    }

    fn event(&mut self) -> Map<String, Value> {
        let mut at = self.clock;
        self.clock += self.tick;
        if self.max_delay_secs > 0 && self.rng.gen_bool(self.late_fraction) {
            at -= Duration::seconds(self.rng.gen_range(1..=self.max_delay_secs));
        }

        let event_type = self.pick(&EVENT_TYPES);
        let amount = self.rng.gen_range(0..50_000) as f64 / 100.0;
        let fields = json!({
            "event_id": format!("evt_{:016x}", self.rng.gen::<u64>()),
            "user_id": self.rng.gen_range(1..=1000),
            "session_id": format!("session_{}", self.rng.gen_range(0..100)),
            "event_type": event_type,
            "event_timestamp": at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "page_url": format!("/page/{}", self.rng.gen_range(0..50)),
            "product_id": format!("prod_{}", self.rng.gen_range(0..200)),
            "quantity": self.rng.gen_range(1..=5),
            "amount": format!("{:.2}", amount),
            "device_type": self.pick(&DEVICES),
            "country": self.pick(&COUNTRIES),
            "browser": self.pick(&BROWSERS),
            "is_logged_in": self.rng.gen_bool(0.7),
            "referrer_source": self.pick(&REFERRERS),
        });
        match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[async_trait]
impl IngestionAdapter for SyntheticEventAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn resume_after(&mut self, offset: u64) -> Result<()> {
        self.skip_through = offset;
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<IngestBatch>> {
        loop {
            if self.batches_remaining == Some(0) {
                return Ok(None);
            }

            let mut records = Vec::with_capacity(self.rows_per_batch);
            for _ in 0..self.rows_per_batch {
                let offset = self.next_offset;
                self.next_offset += 1;
                let fields = self.event();
                if offset <= self.skip_through {
                    continue;
                }
                records.push(RawRecord::new(
                    fields,
                    IngestMetadata {
                        source_id: self.source_id.clone(),
                        ingested_at: Utc::now(),
                        source_partition: "synthetic".to_string(),
                        offset,
                    },
                ));
            }
            if records.is_empty() {
                // every row was at or below the resume point
                continue;
            }
            if let Some(n) = self.batches_remaining.as_mut() {
                *n -= 1;
            }
            return Ok(Some(IngestBatch {
                source_id: self.source_id.clone(),
                records,
                end_offset: self.next_offset - 1,
                malformed: 0,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_stream_is_reproducible_for_a_seed() {
        let start = Utc::now();
        let mut a = SyntheticEventAdapter::new("synthetic", 5, Some(2), 42).starting_at(start);
        let mut b = SyntheticEventAdapter::new("synthetic", 5, Some(2), 42).starting_at(start);

        let first_a = a.next_batch().await.unwrap().unwrap();
        let first_b = b.next_batch().await.unwrap().unwrap();
        assert_eq!(first_a.records.len(), 5);
        let ids = |batch: &IngestBatch| batch.records.iter().map(|r| r.record_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first_a), ids(&first_b));

        assert!(a.next_batch().await.unwrap().is_some());
        assert!(a.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_carry_the_click_stream_fields() {
        let mut adapter = SyntheticEventAdapter::new("synthetic", 1, Some(1), 7);
        let batch = adapter.next_batch().await.unwrap().unwrap();
        let record = &batch.records[0];
        for field in ["event_id", "user_id", "event_type", "event_timestamp", "amount", "device_type"] {
            assert!(record.field(field).is_some(), "missing {}", field);
        }
    }
}
