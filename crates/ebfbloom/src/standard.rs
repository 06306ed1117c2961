//! The classical Bloom filter the receiver fills before encryption.

use log::warn;

use crate::hasher::{bit_positions, BloomHasher, Murmur3_128};
use crate::{filter_len, num_hashes, raw_filter_len, raw_num_hashes, BloomError};

/// Read-only parameter block handed to the encrypted-filter constructor.
#[derive(Clone, Copy, Debug)]
pub struct FilterParams {
    pub len: u64,
    pub hashes: u32,
    pub capacity: u64,
    pub fp_rate: f64,
}

pub struct StandardBloom {
    hasher: Box<dyn BloomHasher>,
    len: u64,
    hashes: u32,
    fp_rate: f64,
    capacity: u64,
    words: Vec<u64>,
    idx: Vec<u64>,
    count: u64,
}

impl StandardBloom {
    pub fn new(capacity: u64, fp_rate: f64) -> Result<Self, BloomError> {
        let hashes = num_hashes(fp_rate)?;
        let len = filter_len(fp_rate, capacity)?;
        Ok(StandardBloom {
            hasher: Box::new(Murmur3_128::new()),
            len,
            hashes,
            fp_rate,
            capacity,
            words: vec![0u64; word_count(len)],
            idx: vec![0u64; hashes as usize],
            count: 0,
        })
    }

    pub fn set_hasher(&mut self, hasher: Box<dyn BloomHasher>) {
        self.hasher = hasher;
    }

    /// Set the k bits for `key`. Past the sizing capacity the filter keeps
    /// accepting elements but the false-positive rate degrades.
    pub fn add(&mut self, key: &[u8]) -> Result<&mut Self, BloomError> {
        bit_positions(self.hasher.as_mut(), key, self.len, &mut self.idx)?;
        for &bit in &self.idx {
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.count += 1;
        if self.count > self.capacity {
            warn!(
                "bloom filter holds {} elements, above its sizing capacity {}",
                self.count, self.capacity
            );
        }
        Ok(self)
    }

    /// True iff every indexed bit is set; never false for an added key.
    pub fn check(&mut self, key: &[u8]) -> Result<bool, BloomError> {
        bit_positions(self.hasher.as_mut(), key, self.len, &mut self.idx)?;
        Ok(self.idx.iter().all(|&bit| self.bit(bit)))
    }

    /// Re-derive k and L from the stored rate and capacity, drop every bit,
    /// and reset the hasher and insertion count.
    pub fn reset(&mut self) {
        self.hashes = raw_num_hashes(self.fp_rate);
        self.len = raw_filter_len(self.fp_rate, self.capacity);
        self.words = vec![0u64; word_count(self.len)];
        self.idx = vec![0u64; self.hashes as usize];
        self.hasher.reset();
        self.count = 0;
    }

    pub fn params(&self) -> FilterParams {
        FilterParams {
            len: self.len,
            hashes: self.hashes,
            capacity: self.capacity,
            fp_rate: self.fp_rate,
        }
    }

    pub fn bit(&self, i: u64) -> bool {
        (self.words[(i / 64) as usize] >> (i % 64)) & 1 == 1
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn clone_hasher(&self) -> Box<dyn BloomHasher> {
        self.hasher.box_clone()
    }
}

fn word_count(len: u64) -> usize {
    ((len + 63) / 64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(count: u64) -> Vec<Vec<u8>> {
        (1..=count).map(|v| v.to_be_bytes().to_vec()).collect()
    }

    #[test]
    fn added_keys_are_always_found() {
        let mut sbf = StandardBloom::new(100, 0.0001).unwrap();
        for key in keys(100) {
            sbf.add(&key).unwrap();
        }
        for key in keys(100) {
            assert!(sbf.check(&key).unwrap(), "no false negatives allowed");
        }
    }

    #[test]
    fn some_fresh_key_misses() {
        let mut sbf = StandardBloom::new(50, 0.0001).unwrap();
        for key in keys(50) {
            sbf.add(&key).unwrap();
        }
        // each candidate false-positives with rate ~1e-4; twenty misses in a
        // row happening by chance is out of the question
        let missed = (1000u64..1020)
            .any(|v| !sbf.check(&v.to_be_bytes()).unwrap());
        assert!(missed);
    }

    #[test]
    fn reset_empties_and_is_idempotent() {
        let mut sbf = StandardBloom::new(10, 0.01).unwrap();
        for key in keys(10) {
            sbf.add(&key).unwrap();
        }
        let params = sbf.params();
        sbf.reset();
        assert_eq!(sbf.count(), 0);
        assert!(sbf.words().iter().all(|&w| w == 0));
        assert!(!sbf.check(&1u64.to_be_bytes()).unwrap());
        sbf.reset();
        let again = sbf.params();
        assert_eq!(params.len, again.len);
        assert_eq!(params.hashes, again.hashes);
        assert_eq!(sbf.count(), 0);
    }

    #[test]
    fn over_capacity_is_soft() {
        let mut sbf = StandardBloom::new(2, 0.01).unwrap();
        for key in keys(5) {
            sbf.add(&key).unwrap();
        }
        assert_eq!(sbf.count(), 5);
        for key in keys(5) {
            assert!(sbf.check(&key).unwrap());
        }
    }

    #[test]
    fn out_of_range_parameters_are_rejected() {
        assert!(StandardBloom::new(0, 0.01).is_err());
        assert!(StandardBloom::new(10, 1.0).is_err());
        assert!(StandardBloom::new(10, 0.0).is_err());
    }

    #[test]
    fn degenerate_filters_hit_vacuously() {
        // k = floor(log2(1/0.9)) = 0: no bits to test, every key reports a hit
        let mut sbf = StandardBloom::new(10, 0.9).unwrap();
        assert_eq!(sbf.params().hashes, 0);
        assert!(sbf.check(&1u64.to_be_bytes()).unwrap());
        sbf.add(&2u64.to_be_bytes()).unwrap();
        assert!(sbf.check(&2u64.to_be_bytes()).unwrap());
    }
}
