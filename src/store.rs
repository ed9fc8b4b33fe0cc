//! Sharded concurrent store.
//!
//! The store maps key hashes to entries across 256 independently locked
//! shards. It knows nothing about admission or cost accounting; the write
//! pipeline keeps it in lockstep with the policy.

use std::sync::Arc;
use std::time::SystemTime;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::ttl::{is_zero_time, ExpirationMap};
use crate::DefaultHashBuilder;

pub(crate) const NUM_SHARDS: u64 = 256;

#[derive(Clone)]
pub(crate) struct Entry<V> {
    pub conflict: u64,
    pub value: V,
    pub expiration: SystemTime,
}

pub(crate) trait Store<V> {
    /// Returns the value associated with the key hash. A nonzero conflict
    /// hash on both sides must match; expired entries are not returned.
    fn get(&self, key: u64, conflict: u64) -> Option<V>;
    /// Adds the entry to the store or overwrites the value if the key hash
    /// is already present and the conflict hashes agree.
    fn set(&self, key: u64, conflict: u64, value: V, expiration: SystemTime);
    /// Replaces the value iff the key hash is present; returns whether it was.
    fn update(&self, key: u64, conflict: u64, value: &V, expiration: SystemTime) -> bool;
    /// Removes and returns the entry; no-op when absent.
    fn remove(&self, key: u64, conflict: u64) -> Option<(u64, V)>;
    /// Expiration time recorded for the key hash, or the zero time.
    fn expiration(&self, key: u64) -> SystemTime;
    /// Sweeps the expiration bucket due at `now`; returns the entries that
    /// were actually expired and removed.
    fn cleanup(&self, now: SystemTime) -> Vec<(u64, u64, V)>;
    /// Removes all entries.
    fn clear(&self);
}

pub(crate) struct ShardedMap<V> {
    shards: Vec<LockedMap<V>>,
    em: Arc<ExpirationMap>,
}

impl<V: Clone> ShardedMap<V> {
    pub(crate) fn new() -> Self {
        let em = Arc::new(ExpirationMap::new());
        ShardedMap {
            shards: (0..NUM_SHARDS).map(|_| LockedMap::new(em.clone())).collect(),
            em,
        }
    }

    fn shard(&self, key: u64) -> &LockedMap<V> {
        &self.shards[(key % NUM_SHARDS) as usize]
    }
}

impl<V: Clone> Store<V> for ShardedMap<V> {
    fn get(&self, key: u64, conflict: u64) -> Option<V> {
        self.shard(key).get(key, conflict)
    }

    fn set(&self, key: u64, conflict: u64, value: V, expiration: SystemTime) {
        self.shard(key).set(key, conflict, value, expiration)
    }

    fn update(&self, key: u64, conflict: u64, value: &V, expiration: SystemTime) -> bool {
        self.shard(key).update(key, conflict, value, expiration)
    }

    fn remove(&self, key: u64, conflict: u64) -> Option<(u64, V)> {
        self.shard(key).remove(key, conflict)
    }

    fn expiration(&self, key: u64) -> SystemTime {
        self.shard(key).expiration(key)
    }

    fn cleanup(&self, now: SystemTime) -> Vec<(u64, u64, V)> {
        let bucket = match self.em.take_cleanup_bucket(now) {
            Some(bucket) => bucket,
            None => return Vec::new(),
        };
        let mut expired = Vec::new();
        for (key, conflict) in bucket {
            // The entry may have been refreshed into a later bucket.
            if self.expiration(key) > now {
                continue;
            }
            if let Some((conflict, value)) = self.remove(key, conflict) {
                expired.push((key, conflict, value));
            }
        }
        expired
    }

    fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
        self.em.clear();
    }
}

struct LockedMap<V> {
    data: RwLock<HashMap<u64, Entry<V>, DefaultHashBuilder>>,
    em: Arc<ExpirationMap>,
}

impl<V: Clone> LockedMap<V> {
    fn new(em: Arc<ExpirationMap>) -> Self {
        LockedMap {
            data: RwLock::new(HashMap::default()),
            em,
        }
    }

    fn get(&self, key: u64, conflict: u64) -> Option<V> {
        let data = self.data.read();
        let entry = data.get(&key)?;
        if conflict != 0 && entry.conflict != 0 && conflict != entry.conflict {
            return None;
        }
        if !is_zero_time(entry.expiration) && SystemTime::now() > entry.expiration {
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: u64, conflict: u64, value: V, expiration: SystemTime) {
        let mut data = self.data.write();
        match data.get(&key) {
            Some(existing) => {
                if conflict != 0 && existing.conflict != 0 && conflict != existing.conflict {
                    return;
                }
                self.em.update(key, conflict, existing.expiration, expiration);
            }
            None => self.em.add(key, conflict, expiration),
        }
        data.insert(
            key,
            Entry {
                conflict,
                value,
                expiration,
            },
        );
    }

    fn update(&self, key: u64, conflict: u64, value: &V, expiration: SystemTime) -> bool {
        let mut data = self.data.write();
        let entry = match data.get_mut(&key) {
            Some(entry) => entry,
            None => return false,
        };
        if conflict != 0 && entry.conflict != 0 && conflict != entry.conflict {
            return false;
        }
        self.em.update(key, conflict, entry.expiration, expiration);
        entry.value = value.clone();
        entry.expiration = expiration;
        true
    }

    fn remove(&self, key: u64, conflict: u64) -> Option<(u64, V)> {
        let mut data = self.data.write();
        let entry = data.get(&key)?;
        if conflict != 0 && entry.conflict != 0 && conflict != entry.conflict {
            return None;
        }
        if !is_zero_time(entry.expiration) {
            self.em.remove(key, entry.expiration);
        }
        let entry = data.remove(&key)?;
        Some((entry.conflict, entry.value))
    }

    fn expiration(&self, key: u64) -> SystemTime {
        self.data
            .read()
            .get(&key)
            .map(|entry| entry.expiration)
            .unwrap_or(std::time::UNIX_EPOCH)
    }

    fn clear(&self) {
        self.data.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn no_expiry() -> SystemTime {
        UNIX_EPOCH
    }

    #[test]
    fn test_set_get() {
        let s: ShardedMap<u64> = ShardedMap::new();
        s.set(1, 0, 101, no_expiry());
        assert_eq!(s.get(1, 0), Some(101));
        assert_eq!(s.get(2, 0), None);
    }

    #[test]
    fn test_set_overwrites() {
        let s: ShardedMap<u64> = ShardedMap::new();
        s.set(1, 0, 101, no_expiry());
        s.set(1, 0, 102, no_expiry());
        assert_eq!(s.get(1, 0), Some(102));
    }

    #[test]
    fn test_conflict_mismatch() {
        let s: ShardedMap<u64> = ShardedMap::new();
        s.set(1, 7, 101, no_expiry());
        assert_eq!(s.get(1, 7), Some(101));
        assert_eq!(s.get(1, 8), None);
        // Conflict 0 on the lookup side skips the check.
        assert_eq!(s.get(1, 0), Some(101));

        assert!(!s.update(1, 8, &999, no_expiry()));
        assert!(s.remove(1, 8).is_none());
        assert_eq!(s.get(1, 7), Some(101));
    }

    #[test]
    fn test_update_only_existing() {
        let s: ShardedMap<u64> = ShardedMap::new();
        assert!(!s.update(1, 0, &101, no_expiry()));
        s.set(1, 0, 101, no_expiry());
        assert!(s.update(1, 0, &102, no_expiry()));
        assert_eq!(s.get(1, 0), Some(102));
    }

    #[test]
    fn test_remove() {
        let s: ShardedMap<u64> = ShardedMap::new();
        s.set(1, 7, 101, no_expiry());
        assert_eq!(s.remove(1, 7), Some((7, 101)));
        assert_eq!(s.get(1, 0), None);
        assert_eq!(s.remove(1, 7), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let s: ShardedMap<u64> = ShardedMap::new();
        let past = SystemTime::now() - Duration::from_secs(10);
        s.set(1, 0, 101, past);
        assert_eq!(s.get(1, 0), None);
    }

    #[test]
    fn test_cleanup_returns_expired() {
        let s: ShardedMap<u64> = ShardedMap::new();
        let exp = SystemTime::now();
        s.set(1, 7, 101, exp);
        s.set(2, 0, 102, no_expiry());

        let later = exp + Duration::from_secs(crate::ttl::BUCKET_DURATION_SECS as u64);
        let expired = s.cleanup(later);
        assert_eq!(expired, vec![(1, 7, 101)]);
        assert_eq!(s.get(2, 0), Some(102));
    }

    #[test]
    fn test_clear() {
        let s: ShardedMap<u64> = ShardedMap::new();
        for i in 0..1000 {
            s.set(i, 0, i, no_expiry());
        }
        s.clear();
        for i in 0..1000 {
            assert_eq!(s.get(i, 0), None);
        }
    }
}
