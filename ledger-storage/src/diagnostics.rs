//! Operational introspection: cache tier sizes and per-entity timings.
//!
//! Nothing here is part of the functional contract. Snapshots serialize with
//! serde so hosts can expose them however they like.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::cache::TierKind;

/// Operation latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s
pub const LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0];

/// Key used for session-wide operations that do not belong to one entity type.
pub const ALL_ENTITIES: &str = "*";

/// Timed controller operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Get,
    List,
    Set,
    Commit,
    Reorg,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Set => "set",
            Operation::Commit => "commit",
            Operation::Reorg => "reorg",
        }
    }
}

/// Fixed-bucket latency histogram.
#[derive(Debug, Clone)]
pub struct TimingHistogram {
    count: u64,
    total: Duration,
    max: Duration,
    /// One slot per bucket plus a trailing overflow slot
    buckets: Vec<u64>,
}

impl Default for TimingHistogram {
    fn default() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            max: Duration::ZERO,
            buckets: vec![0; LATENCY_BUCKETS.len() + 1],
        }
    }
}

impl TimingHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
        let secs = elapsed.as_secs_f64();
        let slot = LATENCY_BUCKETS
            .iter()
            .position(|&le| secs <= le)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[slot] += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Cumulative bucket counts, Prometheus style.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut running = 0;
        let buckets = LATENCY_BUCKETS
            .iter()
            .zip(&self.buckets)
            .map(|(&le, &n)| {
                running += n;
                BucketCount { le, count: running }
            })
            .collect();
        let mean_seconds = if self.count == 0 {
            0.0
        } else {
            self.total.as_secs_f64() / self.count as f64
        };
        HistogramSnapshot {
            count: self.count,
            total_seconds: self.total.as_secs_f64(),
            max_seconds: self.max.as_secs_f64(),
            mean_seconds,
            buckets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketCount {
    pub le: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub total_seconds: f64,
    pub max_seconds: f64,
    pub mean_seconds: f64,
    pub buckets: Vec<BucketCount>,
}

/// Per-entity, per-operation timings.
#[derive(Debug, Clone, Default)]
pub struct Timings {
    by_entity: BTreeMap<String, BTreeMap<Operation, TimingHistogram>>,
}

impl Timings {
    pub fn record(&mut self, entity: &str, op: Operation, elapsed: Duration) {
        self.by_entity
            .entry(entity.to_string())
            .or_default()
            .entry(op)
            .or_default()
            .record(elapsed);
    }

    pub fn get(&self, entity: &str, op: Operation) -> Option<&TimingHistogram> {
        self.by_entity.get(entity)?.get(&op)
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, HistogramSnapshot>> {
        self.by_entity
            .iter()
            .map(|(entity, ops)| {
                let ops = ops
                    .iter()
                    .map(|(op, h)| (op.as_str().to_string(), h.snapshot()))
                    .collect();
                (entity.clone(), ops)
            })
            .collect()
    }
}

/// State of one cache tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSnapshot {
    pub chain: String,
    pub entity: String,
    pub tier: TierKind,
    /// Cached values currently resident
    pub entries: usize,
    /// Size of the id-existence set when loaded
    pub id_set_entries: Option<usize>,
    pub budget_bytes: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Everything a controller can report about itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub chain: String,
    pub phase: String,
    /// Uncommitted revisions held in memory
    pub pending_revisions: usize,
    pub cache: Vec<TierSnapshot>,
    /// Types that outgrew their full-table budget
    pub refused_full_table: Vec<String>,
    pub timings: BTreeMap<String, BTreeMap<String, HistogramSnapshot>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let mut h = TimingHistogram::new();
        h.record(Duration::from_micros(500));
        h.record(Duration::from_millis(20));
        h.record(Duration::from_secs(9));
        let snap = h.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.buckets[0].count, 1);
        // 20ms lands in the 25ms bucket
        assert_eq!(snap.buckets[3].count, 2);
        assert_eq!(snap.buckets.last().map(|b| b.count), Some(2));
        assert!((snap.max_seconds - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_histogram_has_zero_mean() {
        assert_eq!(TimingHistogram::new().snapshot().mean_seconds, 0.0);
    }

    #[test]
    fn test_timings_keyed_by_entity_and_operation() {
        let mut t = Timings::default();
        t.record("Account", Operation::Get, Duration::from_millis(1));
        t.record("Account", Operation::Get, Duration::from_millis(2));
        t.record(ALL_ENTITIES, Operation::Commit, Duration::from_millis(3));
        assert_eq!(t.get("Account", Operation::Get).map(|h| h.count()), Some(2));
        let snap = t.snapshot();
        assert_eq!(snap["Account"]["get"].count, 2);
        assert_eq!(snap["*"]["commit"].count, 1);
        assert!(t.get("Account", Operation::Set).is_none());
    }
}
