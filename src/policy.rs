//! Admission and eviction policy.
//!
//! `TinyLfu` estimates access frequency from the read stream; `SampledLfu`
//! accounts cost for every admitted key and nominates eviction victims by
//! sampled LFU. `LfuPolicy` ties the two together: all cost mutations come
//! from the single write-pipeline consumer, while read batches are absorbed
//! on a separate processor thread that only touches the sketch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::bloom::Bloom;
use crate::cmsketch::CmSketch;
use crate::metrics::{MetricType, Metrics};
use crate::ring;
use crate::DefaultHashBuilder;

/// Number of items sampled when looking for an eviction victim. 5 seems to
/// be the most optimal number [citation needed].
const LFU_SAMPLE: usize = 5;

/// Capacity of the channel carrying read batches to the sketch processor.
/// A full channel drops the batch; the frequency stream is lossy by design.
const BATCH_CHANNEL_CAP: usize = 3;

/// A (key hash, cost) pair crossing the policy/store boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PolicyPair {
    pub key: u64,
    pub cost: i64,
}

pub(crate) struct LfuPolicy {
    admit: Arc<Mutex<TinyLfu>>,
    evict: Mutex<SampledLfu>,
    batch_tx: Sender<Vec<u64>>,
    stop_tx: Sender<()>,
    processor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    metrics: Option<Metrics>,
}

fn process_batches(
    admit: Arc<Mutex<TinyLfu>>,
    batch_rx: Receiver<Vec<u64>>,
    stop_rx: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        select! {
            recv(batch_rx) -> batch => match batch {
                Ok(batch) => admit.lock().push(batch),
                Err(_) => return,
            },
            recv(stop_rx) -> _ => return,
        }
    })
}

impl LfuPolicy {
    pub(crate) fn new(num_counters: i64, max_cost: i64, metrics: Option<Metrics>) -> Self {
        let admit = Arc::new(Mutex::new(TinyLfu::new(num_counters)));
        let (batch_tx, batch_rx) = bounded(BATCH_CHANNEL_CAP);
        let (stop_tx, stop_rx) = bounded(1);
        let processor = process_batches(admit.clone(), batch_rx, stop_rx);

        LfuPolicy {
            admit,
            evict: Mutex::new(SampledLfu::new(max_cost, metrics.clone())),
            batch_tx,
            stop_tx,
            processor: Mutex::new(Some(processor)),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Decides whether the key/cost pair should be accepted. Returns the
    /// victims evicted along the way and whether the candidate was admitted.
    /// Victims are returned even on rejection: they have already left the
    /// cost map and the caller must drop them from the store as well.
    pub(crate) fn add(&self, key: u64, cost: i64) -> (Vec<PolicyPair>, bool) {
        let mut evict = self.evict.lock();

        // Can't add an item bigger than the entire cache.
        if cost > evict.max_cost {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.add(MetricType::RejectSets, key, 1);
            }
            return (Vec::new(), false);
        }

        // Already admitted: refresh the cost, no contest.
        if evict.update_if_has(key, cost) {
            return (Vec::new(), true);
        }

        // Calculate the remaining room in the cache (usually bytes).
        let mut room = evict.room_left(cost);
        if room >= 0 {
            evict.add(key, cost);
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.add(MetricType::CostAdd, key, cost as u64);
            }
            return (Vec::new(), true);
        }

        let admit = self.admit.lock();
        // inc_hits is the hit count for the incoming item.
        let inc_hits = admit.estimate(key);

        // Sample is the eviction candidate pool, filled via map iteration
        // (iteration order is effectively random) and reused across rounds.
        let mut sample = Vec::with_capacity(LFU_SAMPLE);
        let mut victims = Vec::new();

        // Delete victims until there's enough room or a sampled key is found
        // with more hits than the incoming item.
        while room < 0 {
            evict.fill_sample(&mut sample);

            let (mut min_key, mut min_hits, mut min_id, mut min_cost) = (0u64, i64::MAX, 0usize, 0i64);
            for (i, pair) in sample.iter().enumerate() {
                let hits = admit.estimate(pair.key);
                if hits < min_hits {
                    min_key = pair.key;
                    min_hits = hits;
                    min_id = i;
                    min_cost = pair.cost;
                }
            }

            // The newcomer wins ties; only a strictly more frequent incumbent
            // rejects it.
            if inc_hits < min_hits {
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.add(MetricType::RejectSets, key, 1);
                }
                return (victims, false);
            }

            evict.del(min_key);
            sample.swap_remove(min_id);

            if let Some(metrics) = self.metrics.as_ref() {
                metrics.add(MetricType::KeyEvict, min_key, 1);
                metrics.add(MetricType::CostEvict, min_key, min_cost as u64);
            }
            victims.push(PolicyPair {
                key: min_key,
                cost: min_cost,
            });

            room = evict.room_left(cost);
        }

        evict.add(key, cost);
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.add(MetricType::CostAdd, key, cost as u64);
        }
        (victims, true)
    }

    pub(crate) fn has(&self, key: u64) -> bool {
        self.evict.lock().key_costs.contains_key(&key)
    }

    pub(crate) fn remove(&self, key: u64) {
        self.evict.lock().del(key);
    }

    pub(crate) fn update(&self, key: u64, cost: i64) {
        self.evict.lock().update_if_has(key, cost);
    }

    /// Cost recorded for the key, or -1 when the policy does not know it.
    pub(crate) fn cost(&self, key: u64) -> i64 {
        match self.evict.lock().key_costs.get(&key) {
            Some(cost) => *cost,
            None => -1,
        }
    }

    #[cfg(test)]
    pub(crate) fn used(&self) -> i64 {
        self.evict.lock().used
    }

    pub(crate) fn clear(&self) {
        self.admit.lock().clear();
        self.evict.lock().clear();
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.processor.lock().take() {
            let _ = handle.join();
        }
    }
}

impl ring::Consumer for LfuPolicy {
    /// Absorbs a batch of read signals, handing it to the sketch processor
    /// without blocking. Dropped batches only cost hit-ratio accuracy.
    fn push(&self, keys: Vec<u64>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if keys.is_empty() {
            return true;
        }
        let first = keys[0];
        let len = keys.len() as u64;
        match self.batch_tx.try_send(keys) {
            Ok(()) => {
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.add(MetricType::KeepGets, first, len);
                }
                true
            }
            Err(_) => {
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.add(MetricType::DropGets, first, len);
                }
                false
            }
        }
    }
}

impl Drop for LfuPolicy {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cost bookkeeping for admitted keys plus sampled-LFU victim selection.
struct SampledLfu {
    key_costs: HashMap<u64, i64, DefaultHashBuilder>,
    max_cost: i64,
    used: i64,
    metrics: Option<Metrics>,
}

impl SampledLfu {
    fn new(max_cost: i64, metrics: Option<Metrics>) -> Self {
        SampledLfu {
            key_costs: HashMap::default(),
            max_cost,
            used: 0,
            metrics,
        }
    }

    fn room_left(&self, cost: i64) -> i64 {
        self.max_cost - (self.used + cost)
    }

    /// Tops the sample up to `LFU_SAMPLE` entries from the cost map.
    fn fill_sample(&self, input: &mut Vec<PolicyPair>) {
        if input.len() >= LFU_SAMPLE {
            return;
        }
        for (key, cost) in self.key_costs.iter() {
            if input.iter().any(|pair| pair.key == *key) {
                continue;
            }
            input.push(PolicyPair {
                key: *key,
                cost: *cost,
            });
            if input.len() >= LFU_SAMPLE {
                return;
            }
        }
    }

    fn add(&mut self, key: u64, cost: i64) {
        self.key_costs.insert(key, cost);
        self.used += cost;
    }

    fn update_if_has(&mut self, key: u64, cost: i64) -> bool {
        let prev = match self.key_costs.get_mut(&key) {
            Some(prev) => prev,
            None => return false,
        };
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.add(MetricType::KeyUpdate, key, 1);
            if cost > *prev {
                metrics.add(MetricType::CostAdd, key, (cost - *prev) as u64);
            }
        }
        self.used += cost - *prev;
        *prev = cost;
        true
    }

    fn del(&mut self, key: u64) {
        if let Some(cost) = self.key_costs.remove(&key) {
            self.used -= cost;
        }
    }

    fn clear(&mut self) {
        self.used = 0;
        self.key_costs.clear();
    }
}

/// Frequency estimator: doorkeeper bloom filter in front of a CM4 sketch,
/// with periodic halving so history decays.
struct TinyLfu {
    freq: CmSketch,
    door: Bloom,
    incrs: i64,
    reset_at: i64,
}

impl TinyLfu {
    fn new(num_counters: i64) -> Self {
        TinyLfu {
            freq: CmSketch::new(num_counters),
            door: Bloom::new(num_counters as f64, 0.01),
            incrs: 0,
            reset_at: num_counters,
        }
    }

    fn push(&mut self, keys: Vec<u64>) {
        for key in keys {
            self.increment(key);
        }
    }

    fn estimate(&self, key: u64) -> i64 {
        let mut hits = self.freq.estimate(key);
        if self.door.has(key) {
            hits += 1;
        }
        hits
    }

    fn increment(&mut self, key: u64) {
        // The doorkeeper absorbs the first observation; the sketch only
        // counts from the second one on.
        if !self.door.add_if_not_has(key) {
            self.freq.increment(key);
        }
        self.incrs += 1;
        if self.incrs >= self.reset_at {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.incrs = 0;
        self.door.clear();
        self.freq.reset();
    }

    fn clear(&mut self) {
        self.incrs = 0;
        self.door.clear();
        self.freq.clear();
    }
}
