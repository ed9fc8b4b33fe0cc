//! A fast, concurrent, bounded in-memory cache.
//!
//! Admission is decided by a TinyLFU frequency filter fed from a lossy read
//! buffer; eviction picks victims by sampled LFU. The result is a cache that
//! holds on to the keys that earn their keep under skewed access patterns,
//! with get/insert paths that never block on the policy.
//!
//! ```
//! use tinylfu_cache::Cache;
//!
//! let cache = Cache::new(10_000, 1_000, 64).unwrap();
//! cache.insert("key", "value", 1);
//! cache.wait();
//! assert_eq!(cache.get(&"key"), Some("value"));
//! cache.close();
//! ```

mod bloom;
mod cache;
mod cmsketch;
mod error;
mod key;
mod metrics;
mod policy;
mod pool;
mod ring;
mod store;
mod ttl;

pub use cache::{Cache, Config, CostFn, KeyToHashFn, OnEvictFn};
pub use error::CacheError;
pub use key::CacheKey;
pub use metrics::{Metrics, MetricsSnapshot};

/// Default hasher for the internal hash maps.
pub type DefaultHashBuilder = ahash::RandomState;
