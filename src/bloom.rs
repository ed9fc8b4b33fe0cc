//! Doorkeeper bloom filter.
//!
//! A bloom filter answers "possibly in set" or "definitely not in set".
//! The admission policy uses one in front of the frequency sketch so that
//! one-hit wonders set a single bit instead of polluting the counters.
//! Keys arrive already hashed, so the probe locations are derived from the
//! high and low fragments of the 64-bit hash rather than by rehashing.

const LN_2: f64 = std::f64::consts::LN_2;

pub(crate) struct Bloom {
    bits: Vec<u64>,
    /// Number of bits minus one; the bit count is a power of two.
    size_mask: u64,
    /// Probe locations per key.
    set_locs: u64,
    shift: u32,
}

/// Bit count and probe count for an expected number of entries and a target
/// false-positive rate.
fn calc_size_by_wrong_positives(num_entries: f64, wrongs: f64) -> (u64, u64) {
    let size = -1.0 * num_entries * wrongs.ln() / (LN_2 * LN_2);
    let locs = (LN_2 * size / num_entries).ceil();
    (size as u64, locs as u64)
}

/// Round up to a power of two, with a floor of 512 bits.
fn get_size(mut bits: u64) -> (u64, u32) {
    if bits < 512 {
        bits = 512;
    }
    let mut size = 1u64;
    let mut exponent = 0u32;
    while size < bits {
        size <<= 1;
        exponent += 1;
    }
    (size, exponent)
}

impl Bloom {
    /// New filter sized for `num_entries` keys. A `wrongs` below 1.0 is a
    /// false-positive rate; larger values are taken directly as the probe
    /// count with `num_entries` as the bit count.
    pub(crate) fn new(num_entries: f64, wrongs: f64) -> Self {
        let (entries, locs) = if wrongs < 1.0 {
            calc_size_by_wrong_positives(num_entries, wrongs)
        } else {
            (num_entries as u64, wrongs as u64)
        };
        let (size, exponent) = get_size(entries);
        Bloom {
            bits: vec![0u64; (size >> 6) as usize],
            size_mask: size - 1,
            set_locs: locs,
            shift: 64 - exponent,
        }
    }

    /// Sets the bits for `hash`.
    pub(crate) fn add(&mut self, hash: u64) {
        let h = hash >> self.shift;
        let l = (hash << self.shift) >> self.shift;
        for i in 0..self.set_locs {
            self.set(h.wrapping_add(i.wrapping_mul(l)) & self.size_mask);
        }
    }

    /// Adds `hash` only if it is not already present. Returns true if the
    /// hash was added, false if it was already registered.
    pub(crate) fn add_if_not_has(&mut self, hash: u64) -> bool {
        if self.has(hash) {
            return false;
        }
        self.add(hash);
        true
    }

    /// True if all bits for `hash` are set.
    pub(crate) fn has(&self, hash: u64) -> bool {
        let h = hash >> self.shift;
        let l = (hash << self.shift) >> self.shift;
        for i in 0..self.set_locs {
            if !self.is_set(h.wrapping_add(i.wrapping_mul(l)) & self.size_mask) {
                return false;
            }
        }
        true
    }

    /// Resets the filter.
    pub(crate) fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    fn set(&mut self, idx: u64) {
        self.bits[(idx >> 6) as usize] |= 1u64 << (idx & 63);
    }

    fn is_set(&self, idx: u64) -> bool {
        self.bits[(idx >> 6) as usize] >> (idx & 63) & 1 == 1
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    const N: usize = 1 << 16;

    fn wordlist() -> Vec<Vec<u8>> {
        (0..N)
            .map(|_| Uuid::new_v4().as_bytes().to_vec())
            .collect()
    }

    #[test]
    fn test_number_of_wrongs() {
        let mut bf = Bloom::new((N * 10) as f64, 7.0);
        let mut cnt = 0;
        for word in wordlist() {
            if !bf.add_if_not_has(seahash::hash(&word)) {
                cnt += 1;
            }
        }
        // With 10x headroom the false-positive count stays a tiny fraction.
        assert!(
            (cnt as f64) / (N as f64) < 0.005,
            "too many false positives: {cnt}"
        );
    }

    #[test]
    fn test_has() {
        let mut bf = Bloom::new((N * 10) as f64, 7.0);
        assert!(!bf.has(18272025040905874063));
        bf.add_if_not_has(18272025040905874063);
        assert!(bf.has(18272025040905874063));
    }

    #[test]
    fn test_clear() {
        let mut bf = Bloom::new((N * 10) as f64, 7.0);
        bf.add(0xdead_beef);
        assert!(bf.has(0xdead_beef));
        bf.clear();
        assert!(!bf.has(0xdead_beef));
    }

    #[test]
    fn test_size_rounding() {
        let (size, exponent) = get_size(1000);
        assert_eq!(size, 1024);
        assert_eq!(exponent, 10);
        let (size, _) = get_size(1);
        assert_eq!(size, 512);
    }
}
