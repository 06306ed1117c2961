//! ebfbloom: the classical Bloom-filter substrate underneath the encrypted
//! set protocols: parameter derivation, pluggable double hashing, and the
//! plaintext filter the receiver fills before encrypting.

pub mod hasher;
pub mod standard;

pub use hasher::{bit_positions, BloomHasher, Murmur3_128};
pub use standard::{FilterParams, StandardBloom};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BloomError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("hash digest too short: got {got} bytes, need at least 8")]
    DigestTooShort { got: usize },
}

/// Number of hash functions for a target false-positive rate:
/// `k = floor(log2(1/eps))`.
pub fn num_hashes(eps: f64) -> Result<u32, BloomError> {
    check_eps(eps)?;
    Ok(raw_num_hashes(eps))
}

/// Filter length for a target false-positive rate and expected set size:
/// `L = floor(n * log2(e) * log2(1/eps))`.
pub fn filter_len(eps: f64, n: u64) -> Result<u64, BloomError> {
    check_eps(eps)?;
    if n == 0 {
        return Err(BloomError::InvalidParameter(
            "expected set size must be nonzero".into(),
        ));
    }
    Ok(raw_filter_len(eps, n))
}

pub(crate) fn raw_num_hashes(eps: f64) -> u32 {
    (1.0 / eps).log2().floor() as u32
}

pub(crate) fn raw_filter_len(eps: f64, n: u64) -> u64 {
    (n as f64 * std::f64::consts::LOG2_E * (1.0 / eps).log2()).floor() as u64
}

fn check_eps(eps: f64) -> Result<(), BloomError> {
    if !(eps > 0.0 && eps < 1.0) {
        return Err(BloomError::InvalidParameter(format!(
            "false-positive rate {eps} outside (0, 1)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_laws() {
        assert_eq!(num_hashes(0.5).unwrap(), 1);
        assert_eq!(num_hashes(0.0001).unwrap(), 13);
        // floor(100 * log2(e) * log2(10^4)) = floor(1917.01)
        assert_eq!(filter_len(0.0001, 100).unwrap(), 1917);
        assert_eq!(filter_len(0.5, 10).unwrap(), 14);
    }

    #[test]
    fn out_of_range_parameters_are_rejected() {
        assert!(num_hashes(0.0).is_err());
        assert!(num_hashes(1.0).is_err());
        assert!(num_hashes(-0.3).is_err());
        assert!(filter_len(1.5, 10).is_err());
        assert!(filter_len(0.01, 0).is_err());
    }
}
