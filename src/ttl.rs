//! Bucketed expiration tracking.
//!
//! Entries with a TTL are indexed by coarse time buckets so the write
//! pipeline can sweep a whole bucket at once instead of scanning the store.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::DefaultHashBuilder;

/// TODO: find the optimal value or make it configurable.
pub(crate) const BUCKET_DURATION_SECS: i64 = 5;

/// Map of key hash to conflict hash for one bucket.
type Bucket = HashMap<u64, u64, DefaultHashBuilder>;

/// `UNIX_EPOCH` stands in for "no expiration".
pub(crate) fn is_zero_time(t: SystemTime) -> bool {
    t == UNIX_EPOCH
}

pub(crate) fn expiration_for(ttl: Duration) -> SystemTime {
    if ttl.is_zero() {
        UNIX_EPOCH
    } else {
        SystemTime::now() + ttl
    }
}

fn unix_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Bucket an expiration time lands in.
fn storage_bucket(t: SystemTime) -> i64 {
    unix_secs(t) / BUCKET_DURATION_SECS + 1
}

/// Bucket that is safe to sweep at time `now`: the one before the bucket
/// currently being written to.
fn cleanup_bucket(now: SystemTime) -> i64 {
    storage_bucket(now) - 1
}

pub(crate) struct ExpirationMap {
    buckets: Mutex<HashMap<i64, Bucket, DefaultHashBuilder>>,
}

impl ExpirationMap {
    pub(crate) fn new() -> Self {
        ExpirationMap {
            buckets: Mutex::new(HashMap::default()),
        }
    }

    pub(crate) fn add(&self, key: u64, conflict: u64, expiration: SystemTime) {
        // Entries that never expire are not tracked.
        if is_zero_time(expiration) {
            return;
        }
        let bucket_num = storage_bucket(expiration);
        let mut buckets = self.buckets.lock();
        buckets.entry(bucket_num).or_default().insert(key, conflict);
    }

    pub(crate) fn update(
        &self,
        key: u64,
        conflict: u64,
        old_expiration: SystemTime,
        new_expiration: SystemTime,
    ) {
        if is_zero_time(old_expiration) && is_zero_time(new_expiration) {
            return;
        }
        let mut buckets = self.buckets.lock();
        if !is_zero_time(old_expiration) {
            if let Some(bucket) = buckets.get_mut(&storage_bucket(old_expiration)) {
                bucket.remove(&key);
            }
        }
        if !is_zero_time(new_expiration) {
            buckets
                .entry(storage_bucket(new_expiration))
                .or_default()
                .insert(key, conflict);
        }
    }

    pub(crate) fn remove(&self, key: u64, expiration: SystemTime) {
        if is_zero_time(expiration) {
            return;
        }
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(&storage_bucket(expiration)) {
            bucket.remove(&key);
        }
    }

    /// Takes the bucket due for sweeping at `now`, if any.
    pub(crate) fn take_cleanup_bucket(&self, now: SystemTime) -> Option<Bucket> {
        self.buckets.lock().remove(&cleanup_bucket(now))
    }

    pub(crate) fn clear(&self) {
        self.buckets.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_math() {
        let t = UNIX_EPOCH + Duration::from_secs(12);
        assert_eq!(storage_bucket(t), 3);
        assert_eq!(cleanup_bucket(t + Duration::from_secs(5)), 3);
    }

    #[test]
    fn test_zero_time_not_tracked() {
        let em = ExpirationMap::new();
        em.add(1, 0, UNIX_EPOCH);
        assert!(em.take_cleanup_bucket(SystemTime::now() + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_add_then_sweep() {
        let em = ExpirationMap::new();
        let exp = SystemTime::now();
        em.add(1, 7, exp);

        // The bucket becomes sweepable one bucket-duration later.
        let later = exp + Duration::from_secs(BUCKET_DURATION_SECS as u64);
        let bucket = em.take_cleanup_bucket(later).expect("bucket not sweepable");
        assert_eq!(bucket.get(&1), Some(&7));
    }

    #[test]
    fn test_update_moves_buckets() {
        let em = ExpirationMap::new();
        let old = SystemTime::now();
        let new = old + Duration::from_secs(BUCKET_DURATION_SECS as u64 * 4);
        em.add(1, 7, old);
        em.update(1, 7, old, new);

        let later = old + Duration::from_secs(BUCKET_DURATION_SECS as u64);
        if let Some(bucket) = em.take_cleanup_bucket(later) {
            assert!(bucket.get(&1).is_none());
        }
    }

    #[test]
    fn test_remove() {
        let em = ExpirationMap::new();
        let exp = SystemTime::now();
        em.add(1, 7, exp);
        em.remove(1, exp);

        let later = exp + Duration::from_secs(BUCKET_DURATION_SECS as u64);
        if let Some(bucket) = em.take_cleanup_bucket(later) {
            assert!(bucket.get(&1).is_none());
        }
    }
}
