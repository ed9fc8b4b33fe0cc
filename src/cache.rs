//! Cache front-end and write pipeline.
//!
//! Producers hash keys, read through the sharded store and push access
//! signals into the lossy ring buffer. Every mutation is funneled through a
//! bounded channel into a single consumer thread; having one consumer make
//! every policy and store mutation is what keeps the two in lockstep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::CacheError;
use crate::key::CacheKey;
use crate::metrics::{MetricType, Metrics};
use crate::policy::LfuPolicy;
use crate::ring::RingBuffer;
use crate::store::{ShardedMap, Store};
use crate::ttl::{expiration_for, BUCKET_DURATION_SECS};

/// Called for every eviction with the key hash, conflict hash, evicted value
/// and its cost.
pub type OnEvictFn<V> = Box<dyn Fn(u64, u64, &V, i64) + Send + Sync>;

/// Computes the cost of a value when an item arrives with cost 0.
pub type CostFn<V> = Box<dyn Fn(&V) -> i64 + Send + Sync>;

/// Overrides [`CacheKey`] hashing for this cache instance.
pub type KeyToHashFn<K> = Box<dyn Fn(&K) -> (u64, u64) + Send + Sync>;

const DEFAULT_SET_BUFFER_SIZE: usize = 32 * 1024;

/// Config is passed to [`Cache::with_config`] when creating new instances.
pub struct Config<K, V> {
    /// Number of counters (keys) to keep that hold access frequency
    /// information. It's generally a good idea to have more counters than
    /// the max cache capacity, as this will improve eviction accuracy and
    /// subsequent hit ratios.
    ///
    /// For example, if you expect your cache to hold 1,000,000 items when
    /// full, num_counters should be 10,000,000 (10x). Each counter takes up
    /// 4 bits, so keeping 10,000,000 counters would require 5MB of memory.
    pub num_counters: i64,

    /// The cache capacity, in whatever units you choose to use.
    ///
    /// For example, if you want the cache to have a max capacity of 100MB,
    /// you would set max_cost to 100,000,000 and pass an item's number of
    /// bytes as the `cost` parameter for calls to insert.
    pub max_cost: i64,

    /// Size of each get buffer stripe.
    ///
    /// Unless you have a rare use case, using `64` as the buffer_items value
    /// results in good performance.
    pub buffer_items: usize,

    /// Whether cache statistics are kept during the cache's lifetime. There
    /// *is* some overhead to keeping statistics, so you should only set this
    /// flag to true when testing or throughput performance isn't a major
    /// factor.
    pub metrics: bool,

    /// Number of get-buffer stripes in the pool. 0 means one per CPU.
    pub pool_capacity: usize,

    /// Capacity of the write channel. 0 means the 32K default.
    pub set_buffer_size: usize,

    /// Called for every eviction.
    pub on_evict: Option<OnEvictFn<V>>,

    /// Called by the pipeline for items inserted with cost 0.
    pub cost: Option<CostFn<V>>,

    /// Replaces the default key hashing.
    pub key_to_hash: Option<KeyToHashFn<K>>,
}

impl<K, V> Default for Config<K, V> {
    fn default() -> Self {
        Config {
            num_counters: 1e7 as i64,
            max_cost: 1 << 20,
            buffer_items: 64,
            metrics: false,
            pool_capacity: 0,
            set_buffer_size: DEFAULT_SET_BUFFER_SIZE,
            on_evict: None,
            cost: None,
            key_to_hash: None,
        }
    }
}

/// Work items flowing through the write channel.
enum Item<V> {
    New {
        key: u64,
        conflict: u64,
        value: V,
        cost: i64,
        expiration: SystemTime,
    },
    Update {
        key: u64,
        value: V,
        cost: i64,
    },
    Delete {
        key: u64,
        conflict: u64,
    },
    /// Quiesce marker: acked once every item enqueued before it has been
    /// processed.
    Wait(Sender<()>),
}

/// State shared between the front-end and the consumer thread.
struct InnerCache<V> {
    store: ShardedMap<V>,
    policy: Arc<LfuPolicy>,
    metrics: Option<Metrics>,
    on_evict: Option<OnEvictFn<V>>,
    cost: Option<CostFn<V>>,
}

/// A concurrent, bounded cache with TinyLFU admission and sampled-LFU
/// eviction.
///
/// Inserts are asynchronous: an item becomes visible to readers once the
/// write pipeline has admitted it (except for inserts over an existing key,
/// which update the store immediately). [`Cache::wait`] blocks until the
/// pipeline has drained everything enqueued so far.
pub struct Cache<K, V: Clone> {
    inner: Arc<InnerCache<V>>,
    get_buf: RingBuffer,
    set_buf: RwLock<Sender<Item<V>>>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    processor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    set_buffer_size: usize,
    key_to_hash: Option<KeyToHashFn<K>>,
}

impl<K, V> Cache<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    /// A cache with the given counter, capacity and buffer sizes; all three
    /// must be nonzero.
    pub fn new(num_counters: i64, max_cost: i64, buffer_items: usize) -> Result<Self, CacheError> {
        Cache::with_config(Config {
            num_counters,
            max_cost,
            buffer_items,
            ..Config::default()
        })
    }

    pub fn with_config(config: Config<K, V>) -> Result<Self, CacheError> {
        if config.num_counters <= 0 {
            return Err(CacheError::InvalidNumCounters);
        }
        if config.max_cost <= 0 {
            return Err(CacheError::InvalidMaxCost);
        }
        if config.buffer_items == 0 {
            return Err(CacheError::InvalidBufferItems);
        }

        let metrics = config.metrics.then(Metrics::new);
        let policy = Arc::new(LfuPolicy::new(
            config.num_counters,
            config.max_cost,
            metrics.clone(),
        ));

        let pool_capacity = if config.pool_capacity == 0 {
            num_cpus::get()
        } else {
            config.pool_capacity
        };
        let get_buf = RingBuffer::new(
            policy.clone(),
            pool_capacity,
            config.buffer_items,
            metrics.clone(),
        );

        let set_buffer_size = if config.set_buffer_size == 0 {
            DEFAULT_SET_BUFFER_SIZE
        } else {
            config.set_buffer_size
        };
        let (set_tx, set_rx) = bounded(set_buffer_size);
        let (stop_tx, stop_rx) = bounded(1);

        let inner = Arc::new(InnerCache {
            store: ShardedMap::new(),
            policy,
            metrics,
            on_evict: config.on_evict,
            cost: config.cost,
        });

        let processor = process_items(inner.clone(), set_rx, stop_rx.clone());
        log::debug!(
            "cache started: num_counters={} max_cost={}",
            config.num_counters,
            config.max_cost
        );

        Ok(Cache {
            inner,
            get_buf,
            set_buf: RwLock::new(set_tx),
            stop_tx,
            stop_rx,
            processor: Mutex::new(Some(processor)),
            closed: AtomicBool::new(false),
            set_buffer_size,
            key_to_hash: config.key_to_hash,
        })
    }

    fn hash_key(&self, key: &K) -> (u64, u64) {
        match self.key_to_hash.as_ref() {
            Some(f) => f(key),
            None => key.key_to_hash(),
        }
    }

    /// Returns the value for `key` if it is present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let (key_hash, conflict) = self.hash_key(key);
        self.get_buf.push(key_hash);
        let value = self.inner.store.get(key_hash, conflict);
        if let Some(metrics) = self.inner.metrics.as_ref() {
            if value.is_some() {
                metrics.add(MetricType::Hit, key_hash, 1);
            } else {
                metrics.add(MetricType::Miss, key_hash, 1);
            }
        }
        value
    }

    /// Offers the key/value pair to the cache at the given cost. Returns
    /// whether the item was taken into the write buffer; a true return does
    /// not mean the item was admitted.
    pub fn insert(&self, key: K, value: V, cost: i64) -> bool {
        self.insert_with_ttl(key, value, cost, Duration::ZERO)
    }

    /// Like [`Cache::insert`], expiring the entry after `ttl`. A zero `ttl`
    /// never expires.
    pub fn insert_with_ttl(&self, key: K, value: V, cost: i64, ttl: Duration) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let (key_hash, conflict) = self.hash_key(&key);
        let expiration = expiration_for(ttl);

        // Update the store optimistically so a refresh of an existing key is
        // visible to the very next get, without waiting on the pipeline.
        let item = if self
            .inner
            .store
            .update(key_hash, conflict, &value, expiration)
        {
            Item::Update {
                key: key_hash,
                value,
                cost,
            }
        } else {
            Item::New {
                key: key_hash,
                conflict,
                value,
                cost,
                expiration,
            }
        };
        let is_update = matches!(item, Item::Update { .. });

        match self.set_buf.read().try_send(item) {
            Ok(()) => true,
            Err(_) => {
                if is_update {
                    // The store already carries the new value; only the cost
                    // refresh was lost.
                    return true;
                }
                if let Some(metrics) = self.inner.metrics.as_ref() {
                    metrics.add(MetricType::DropSets, key_hash, 1);
                }
                false
            }
        }
    }

    /// Removes `key` from the cache. The removal happens on the write
    /// pipeline, not synchronously with this call.
    pub fn remove(&self, key: &K) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (key_hash, conflict) = self.hash_key(key);
        if self
            .set_buf
            .read()
            .try_send(Item::Delete {
                key: key_hash,
                conflict,
            })
            .is_err()
        {
            if let Some(metrics) = self.inner.metrics.as_ref() {
                metrics.add(MetricType::DropSets, key_hash, 1);
            }
        }
    }

    /// Blocks until the write pipeline has processed every item enqueued
    /// before this call.
    pub fn wait(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (ack_tx, ack_rx) = bounded(1);
        if self.set_buf.read().send(Item::Wait(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Drops every entry and restarts the write pipeline. Anything still in
    /// the write buffer is discarded. Callers must quiesce producers around
    /// this call; concurrent access during clear is undefined.
    pub fn clear(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.processor.lock().take() {
            let _ = handle.join();
        }

        self.inner.policy.clear();
        self.inner.store.clear();
        if let Some(metrics) = self.inner.metrics.as_ref() {
            metrics.clear();
        }

        let (set_tx, set_rx) = bounded(self.set_buffer_size);
        *self.set_buf.write() = set_tx;
        *self.processor.lock() = Some(process_items(
            self.inner.clone(),
            set_rx,
            self.stop_rx.clone(),
        ));
        log::debug!("cache cleared");
    }

    /// Stops the background workers. Items still in the write buffer are
    /// dropped; every operation afterwards is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.processor.lock().take() {
            let _ = handle.join();
        }
        self.inner.policy.close();
        log::debug!("cache closed");
    }

    /// Statistics, when the cache was built with `metrics: true`.
    pub fn metrics(&self) -> Option<&Metrics> {
        self.inner.metrics.as_ref()
    }
}

impl<K, V: Clone> Drop for Cache<K, V> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.processor.lock().take() {
            let _ = handle.join();
        }
        self.inner.policy.close();
        log::debug!("cache closed");
    }
}

fn process_items<V: Clone + Send + Sync + 'static>(
    inner: Arc<InnerCache<V>>,
    set_rx: Receiver<Item<V>>,
    stop_rx: Receiver<()>,
) -> JoinHandle<()> {
    let ticker = tick(Duration::from_millis(BUCKET_DURATION_SECS as u64 * 500));
    std::thread::spawn(move || loop {
        select! {
            recv(set_rx) -> item => match item {
                Ok(item) => inner.process(item),
                Err(_) => return,
            },
            recv(ticker) -> _ => inner.sweep_expired(SystemTime::now()),
            recv(stop_rx) -> _ => return,
        }
    })
}

impl<V: Clone> InnerCache<V> {
    fn compute_cost(&self, cost: i64, value: &V) -> i64 {
        if cost == 0 {
            if let Some(cost_fn) = self.cost.as_ref() {
                return cost_fn(value);
            }
        }
        cost
    }

    fn process(&self, item: Item<V>) {
        match item {
            Item::New {
                key,
                conflict,
                value,
                cost,
                expiration,
            } => {
                let cost = self.compute_cost(cost, &value);
                let (victims, added) = self.policy.add(key, cost);
                if added {
                    self.store.set(key, conflict, value, expiration);
                    if let Some(metrics) = self.metrics.as_ref() {
                        metrics.add(MetricType::KeyAdd, key, 1);
                    }
                }
                for victim in victims {
                    // The victim's original key is unknown here, so the
                    // entry is taken out by key hash alone.
                    if let Some((conflict, value)) = self.store.remove(victim.key, 0) {
                        if let Some(on_evict) = self.on_evict.as_ref() {
                            on_evict(victim.key, conflict, &value, victim.cost);
                        }
                    }
                }
            }
            Item::Update { key, value, cost } => {
                let cost = self.compute_cost(cost, &value);
                self.policy.update(key, cost);
            }
            Item::Delete { key, conflict } => {
                self.policy.remove(key);
                self.store.remove(key, conflict);
            }
            Item::Wait(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn sweep_expired(&self, now: SystemTime) {
        for (key, conflict, value) in self.store.cleanup(now) {
            let cost = self.policy.cost(key);
            self.policy.remove(key);
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.add(MetricType::KeyEvict, key, 1);
                if cost > 0 {
                    metrics.add(MetricType::CostEvict, key, cost as u64);
                }
            }
            if let Some(on_evict) = self.on_evict.as_ref() {
                on_evict(key, conflict, &value, cost);
            }
        }
    }
}
