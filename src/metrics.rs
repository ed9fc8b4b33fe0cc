//! Cache statistics.
//!
//! Counters are amortized: every metric is an array of 256 atomics and each
//! increment picks a slot from the key hash, spaced so that concurrently
//! bumped slots land on distinct cache lines. Reads sum the whole array, so
//! totals are eventually consistent and may briefly under-count.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

// The following 2 keep track of hits and misses.
// The following 3 keep track of number of keys added, updated and evicted.
// The following 2 keep track of cost of keys added and evicted.
// The following 2 keep track of how many sets were dropped or rejected later.
// The final 2 keep track of how many gets were kept and dropped on the floor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MetricType {
    Hit,
    Miss,
    KeyAdd,
    KeyUpdate,
    KeyEvict,
    CostAdd,
    CostEvict,
    DropSets,
    RejectSets,
    DropGets,
    KeepGets,
}

const NUM_METRICS: usize = 11;
const NUM_SLOTS: usize = 256;

/// Sharded atomic counters for one cache instance.
///
/// Cheap to clone; clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    all: Arc<Vec<Box<[AtomicU64]>>>,
}

fn new_slot_array() -> Box<[AtomicU64]> {
    (0..NUM_SLOTS)
        .map(|_| AtomicU64::new(0))
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

impl Metrics {
    pub(crate) fn new() -> Metrics {
        Metrics {
            all: Arc::new((0..NUM_METRICS).map(|_| new_slot_array()).collect()),
        }
    }

    pub(crate) fn add(&self, t: MetricType, hash: u64, delta: u64) {
        // 25 slots, 10 apart, so concurrent increments sit on distinct
        // cache lines.
        let idx = ((hash % 25) * 10) as usize;
        self.all[t as usize][idx].fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn get(&self, t: MetricType) -> u64 {
        self.all[t as usize]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }

    pub fn hits(&self) -> u64 {
        self.get(MetricType::Hit)
    }

    pub fn misses(&self) -> u64 {
        self.get(MetricType::Miss)
    }

    pub fn keys_added(&self) -> u64 {
        self.get(MetricType::KeyAdd)
    }

    pub fn keys_updated(&self) -> u64 {
        self.get(MetricType::KeyUpdate)
    }

    pub fn keys_evicted(&self) -> u64 {
        self.get(MetricType::KeyEvict)
    }

    pub fn cost_added(&self) -> u64 {
        self.get(MetricType::CostAdd)
    }

    pub fn cost_evicted(&self) -> u64 {
        self.get(MetricType::CostEvict)
    }

    pub fn sets_dropped(&self) -> u64 {
        self.get(MetricType::DropSets)
    }

    pub fn sets_rejected(&self) -> u64 {
        self.get(MetricType::RejectSets)
    }

    pub fn gets_dropped(&self) -> u64 {
        self.get(MetricType::DropGets)
    }

    pub fn gets_kept(&self) -> u64 {
        self.get(MetricType::KeepGets)
    }

    /// Hits over total gets, or 0.0 before any get has been observed.
    pub fn ratio(&self) -> f64 {
        let hits = self.hits();
        let misses = self.misses();
        if hits == 0 && misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }

    /// A point-in-time copy of every counter, suitable for serialization.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            keys_added: self.keys_added(),
            keys_updated: self.keys_updated(),
            keys_evicted: self.keys_evicted(),
            cost_added: self.cost_added(),
            cost_evicted: self.cost_evicted(),
            sets_dropped: self.sets_dropped(),
            sets_rejected: self.sets_rejected(),
            gets_dropped: self.gets_dropped(),
            gets_kept: self.gets_kept(),
            hit_ratio: self.ratio(),
        }
    }

    pub(crate) fn clear(&self) {
        for slot in self.all.iter().flat_map(|arr| arr.iter()) {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// Serializable view of [`Metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    #[serde(rename = "keys-added")]
    pub keys_added: u64,
    #[serde(rename = "keys-updated")]
    pub keys_updated: u64,
    #[serde(rename = "keys-evicted")]
    pub keys_evicted: u64,
    #[serde(rename = "cost-added")]
    pub cost_added: u64,
    #[serde(rename = "cost-evicted")]
    pub cost_evicted: u64,
    #[serde(rename = "sets-dropped")]
    pub sets_dropped: u64,
    #[serde(rename = "sets-rejected")]
    pub sets_rejected: u64,
    #[serde(rename = "gets-dropped")]
    pub gets_dropped: u64,
    #[serde(rename = "gets-kept")]
    pub gets_kept: u64,
    #[serde(rename = "hit-ratio")]
    pub hit_ratio: f64,
}

impl Display for Metrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.snapshot()) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}
