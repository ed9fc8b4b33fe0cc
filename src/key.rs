use xxhash_rust::xxh3::xxh3_64;

/// CacheKey turns a user key into the pair of 64-bit hashes the cache works
/// with: the key hash the store and policy index by, and an independent
/// conflict hash kept with the entry to detect key-hash collisions on lookup.
///
/// A conflict hash of 0 disables collision checking for that key. Integer
/// keys hash to themselves with conflict 0, since the key hash already is the
/// full key.
pub trait CacheKey {
    fn key_to_hash(&self) -> (u64, u64);
}

macro_rules! impl_int_key {
    ($($t:ty),*) => {
        $(
            impl CacheKey for $t {
                #[inline]
                fn key_to_hash(&self) -> (u64, u64) {
                    (*self as u64, 0)
                }
            }
        )*
    };
}

impl_int_key!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl CacheKey for [u8] {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        (seahash::hash(self), xxh3_64(self))
    }
}

impl CacheKey for str {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        self.as_bytes().key_to_hash()
    }
}

impl CacheKey for String {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        self.as_bytes().key_to_hash()
    }
}

impl CacheKey for Vec<u8> {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        self.as_slice().key_to_hash()
    }
}

impl<T: CacheKey + ?Sized> CacheKey for &T {
    #[inline]
    fn key_to_hash(&self) -> (u64, u64) {
        (**self).key_to_hash()
    }
}
