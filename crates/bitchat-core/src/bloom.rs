//! Bloom filter used to suppress duplicate packets in the flood.
//!
//! Sized once from an expected element count and a target false-positive
//! rate. There is no eviction: the engine clears the filter on a fixed
//! cadence (see `EngineConfig`), trading a short window of possible
//! re-delivery for a bounded false-positive rate.

use sha2::{Digest, Sha256};
use std::f64::consts::LN_2;

/// Probabilistic set of packet dedup keys.
///
/// `contains` may return false positives but never false negatives.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    size_bits: usize,
    hash_count: u32,
    inserted: usize,
}

impl BloomFilter {
    /// Create a filter for `expected_elements` at `false_positive_rate`.
    ///
    /// `m = ceil(-n ln p / (ln 2)^2)` bits and `k = ceil((m / n) ln 2)`
    /// hash rounds. Out-of-range inputs are clamped to usable values.
    pub fn new(expected_elements: usize, false_positive_rate: f64) -> Self {
        let n = expected_elements.max(1) as f64;
        let p = if false_positive_rate.is_finite() {
            false_positive_rate.clamp(1e-9, 0.5)
        } else {
            0.01
        };

        let m = (-n * p.ln() / (LN_2 * LN_2)).ceil().max(8.0) as usize;
        let k = ((m as f64 / n) * LN_2).ceil().max(1.0) as u32;

        Self {
            bits: vec![0u64; m.div_ceil(64)],
            size_bits: m,
            hash_count: k,
            inserted: 0,
        }
    }

    /// Number of bits in the filter.
    pub fn size_bits(&self) -> usize {
        self.size_bits
    }

    /// Number of hash rounds per key.
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Number of insertions since creation or the last [`clear`](Self::clear).
    pub fn len(&self) -> usize {
        self.inserted
    }

    /// Whether nothing was inserted since the last clear.
    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    /// Insert a key.
    pub fn add(&mut self, key: &[u8]) {
        for index in self.bit_indices(key) {
            self.bits[index / 64] |= 1u64 << (index % 64);
        }
        self.inserted += 1;
    }

    /// Test membership. True iff every derived bit is set.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.bit_indices(key)
            .all(|index| self.bits[index / 64] & (1u64 << (index % 64)) != 0)
    }

    /// Insert a key and report whether it was already (probably) present.
    pub fn check_and_add(&mut self, key: &[u8]) -> bool {
        let present = self.contains(key);
        if !present {
            self.add(key);
        }
        present
    }

    /// Zero the bit array in place.
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
        self.inserted = 0;
    }

    /// Expected false-positive rate at the current fill level.
    pub fn estimated_fp_rate(&self) -> f64 {
        let k = self.hash_count as f64;
        let fill = (-k * self.inserted as f64 / self.size_bits as f64).exp();
        (1.0 - fill).powf(k)
    }

    /// Seeded double hashing over one SHA-256 digest: `h1 + i * h2 mod m`.
    fn bit_indices(&self, key: &[u8]) -> impl Iterator<Item = usize> {
        let digest = Sha256::digest(key);
        let mut h1_bytes = [0u8; 8];
        let mut h2_bytes = [0u8; 8];
        h1_bytes.copy_from_slice(&digest[..8]);
        h2_bytes.copy_from_slice(&digest[8..16]);

        let h1 = u64::from_le_bytes(h1_bytes);
        // odd step so successive rounds never collapse onto one bit
        let h2 = u64::from_le_bytes(h2_bytes) | 1;
        let m = self.size_bits as u64;

        (0..self.hash_count as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sizing_formula() {
        let filter = BloomFilter::new(1000, 0.01);
        // -1000 * ln(0.01) / ln(2)^2 = 9585.06
        assert_eq!(filter.size_bits(), 9586);
        // 9.586 * ln 2 = 6.64
        assert_eq!(filter.hash_count(), 7);
    }

    #[test]
    fn test_add_then_contains() {
        let mut filter = BloomFilter::new(100, 0.01);
        assert!(!filter.contains(b"sender-1:1000"));

        filter.add(b"sender-1:1000");
        assert!(filter.contains(b"sender-1:1000"));

        // idempotent
        filter.add(b"sender-1:1000");
        assert!(filter.contains(b"sender-1:1000"));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_check_and_add() {
        let mut filter = BloomFilter::new(100, 0.01);
        assert!(!filter.check_and_add(b"key"));
        assert!(filter.check_and_add(b"key"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.add(b"a");
        filter.add(b"b");
        filter.clear();
        assert!(filter.is_empty());
        assert!(!filter.contains(b"a"));
        assert!(!filter.contains(b"b"));
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(2000, 0.01);
        let keys: Vec<Vec<u8>> = (0u32..2000).map(|i| i.to_be_bytes().to_vec()).collect();
        for key in &keys {
            filter.add(key);
        }
        assert!(keys.iter().all(|key| filter.contains(key)));
    }

    #[test]
    fn test_false_positive_rate_within_bound() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0u64..1000 {
            filter.add(&i.to_be_bytes());
        }

        let trials = 20_000u64;
        let false_positives = (1_000_000u64..1_000_000 + trials)
            .filter(|i| filter.contains(&i.to_be_bytes()))
            .count();

        let rate = false_positives as f64 / trials as f64;
        assert!(rate < 0.02, "false positive rate {} too high", rate);
        assert!(filter.estimated_fp_rate() < 0.012);
    }

    #[test]
    fn test_degenerate_parameters_clamped() {
        let filter = BloomFilter::new(0, 0.0);
        assert!(filter.size_bits() >= 8);
        assert!(filter.hash_count() >= 1);

        let filter = BloomFilter::new(10, f64::NAN);
        assert!(filter.size_bits() >= 8);
    }

    proptest! {
        #[test]
        fn prop_inserted_keys_always_found(
            keys in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..32), 1..200),
        ) {
            let mut filter = BloomFilter::new(keys.len(), 0.01);
            for key in &keys {
                filter.add(key);
            }
            for key in &keys {
                prop_assert!(filter.contains(key));
            }
            prop_assert_eq!(filter.len(), keys.len());
        }
    }
}
