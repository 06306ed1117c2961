//! ebfcrypto: Paillier primitives for the encrypted Bloom filter protocols.
//!
//! Standard Paillier with `g = n + 1`: key generation, encrypt/decrypt,
//! homomorphic ciphertext addition, ciphertext-times-plaintext, and
//! rerandomisation. Every big integer crosses an API boundary as a
//! big-endian byte string.

use rand::RngCore;
use rug::integer::{IsPrime, Order};
use rug::{Assign, Integer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGen(String),
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

// ---------------- Keys and ciphertexts ----------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaillierPublicKey {
    #[serde(with = "serde_bytes")]
    pub n: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub n2: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaillierPrivateKey {
    #[serde(with = "serde_bytes")]
    pub lambda: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub mu: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub n: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub n2: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl PaillierPublicKey {
    pub fn n(&self) -> Integer {
        int_from_be(&self.n)
    }
    pub fn n2(&self) -> Integer {
        int_from_be(&self.n2)
    }
}

impl PaillierPrivateKey {
    pub fn n(&self) -> Integer {
        int_from_be(&self.n)
    }
    pub fn n2(&self) -> Integer {
        int_from_be(&self.n2)
    }
    pub fn lambda(&self) -> Integer {
        int_from_be(&self.lambda)
    }
    pub fn mu(&self) -> Integer {
        int_from_be(&self.mu)
    }
}

#[inline]
pub fn int_from_be(bytes: &[u8]) -> Integer {
    Integer::from_digits(bytes, Order::MsfBe)
}

#[inline]
pub fn int_to_be(i: &Integer) -> Vec<u8> {
    i.to_digits::<u8>(Order::MsfBe)
}

// ---------------- Random sampling ----------------

/// Uniform draw from `[0, 2^bits)`.
pub fn rand_bits(bits: usize, rng: &mut impl RngCore) -> Integer {
    if bits == 0 {
        return Integer::new();
    }
    let nbytes = (bits + 7) / 8;
    let mut bytes = vec![0u8; nbytes];
    rng.fill_bytes(&mut bytes);
    // mask off any extra MSBs so the value < 2^bits
    let excess = 8 * nbytes - bits;
    if excess > 0 {
        bytes[0] &= 0xFFu8 >> excess;
    }
    Integer::from_digits(&bytes, Order::MsfBe)
}

/// Uniform draw from `[0, n)` by rejection sampling.
pub fn rand_below(n: &Integer, rng: &mut impl RngCore) -> Integer {
    let bits = n.significant_bits() as usize;
    loop {
        let c = rand_bits(bits, rng);
        if &c < n {
            return c;
        }
    }
}

// ---------------- Paillier core ----------------

pub fn keygen(
    bits: u32,
    rng: &mut impl RngCore,
) -> Result<(PaillierPublicKey, PaillierPrivateKey), CryptoError> {
    if bits < 16 {
        return Err(CryptoError::KeyGen(format!(
            "{bits}-bit modulus is too small"
        )));
    }
    let half = bits / 2;
    let mut gen_prime = |bits: u32| -> Integer {
        loop {
            let mut bytes = vec![0u8; (bits as usize + 7) / 8];
            rng.fill_bytes(&mut bytes);
            // force top bit and odd
            if let Some(b) = bytes.first_mut() {
                *b |= 0x80;
            }
            if let Some(b) = bytes.last_mut() {
                *b |= 1;
            }
            let mut p = Integer::from_digits(&bytes, Order::MsfBe);
            p.next_prime_mut();
            if p.is_probably_prime(25) != IsPrime::No {
                return p;
            }
        }
    };
    let p = gen_prime(half);
    let q = gen_prime(half);
    let n: Integer = (&p * &q).into();
    let n2: Integer = (&n * &n).into();
    let lambda: Integer = Integer::from(&p - 1).lcm(&Integer::from(&q - 1));
    let g: Integer = Integer::from(&n + 1);
    let gl = g
        .pow_mod(&lambda, &n2)
        .map_err(|_| CryptoError::KeyGen("pow_mod rejected the exponent".into()))?;
    let mu = l_residue(gl, &n)
        .invert(&n)
        .map_err(|_| CryptoError::KeyGen("L(g^lambda) has no inverse mod n".into()))?;

    let pk = PaillierPublicKey {
        n: int_to_be(&n),
        n2: int_to_be(&n2),
    };
    let sk = PaillierPrivateKey {
        lambda: int_to_be(&lambda),
        mu: int_to_be(&mu),
        n: pk.n.clone(),
        n2: pk.n2.clone(),
    };
    Ok((pk, sk))
}

// L(u) = (u - 1) / n
fn l_residue(mut u: Integer, n: &Integer) -> Integer {
    u -= 1;
    u / n
}

pub fn enc(pk: &PaillierPublicKey, m: &Integer, rng: &mut impl RngCore) -> Ciphertext {
    let n = pk.n();
    let n2 = pk.n2();
    let mut r = rand_below(&n, rng);
    if r == 0 {
        r.assign(1);
    }
    let g: Integer = Integer::from(&n + 1);
    let c = (g.pow_mod(m, &n2).unwrap() * r.pow_mod(&n, &n2).unwrap()) % n2;
    Ciphertext(int_to_be(&c))
}

pub fn dec(sk: &PaillierPrivateKey, c: &Ciphertext) -> Result<Integer, CryptoError> {
    let n = sk.n();
    let n2 = sk.n2();
    let ci = int_from_be(&c.0);
    if ci == 0 || ci >= n2 {
        return Err(CryptoError::Malformed("value outside Z*_{n^2}".into()));
    }
    let u = ci.pow_mod(&sk.lambda(), &n2).unwrap();
    Ok((l_residue(u, &n) * sk.mu()) % n)
}

/// Homomorphic plaintext addition: `Dec(add(a, b)) = Dec(a) + Dec(b) mod n`.
pub fn add(pk: &PaillierPublicKey, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
    let n2 = pk.n2();
    let ai = int_from_be(&a.0);
    let bi = int_from_be(&b.0);
    Ciphertext(int_to_be(&((ai * bi) % n2)))
}

/// Ciphertext-times-plaintext: `Dec(mul_plain(a, k)) = Dec(a) * k mod n`.
pub fn mul_plain(pk: &PaillierPublicKey, a: &Ciphertext, k: &Integer) -> Ciphertext {
    let n2 = pk.n2();
    let mut ai = int_from_be(&a.0);
    // negative scalars act through their residue mod n
    let mut kk = k.clone();
    if kk.is_negative() {
        let n = pk.n();
        kk = (kk % &n + &n) % &n;
    }
    ai.pow_mod_mut(&kk, &n2).unwrap();
    Ciphertext(int_to_be(&ai))
}

/// Fold in a fresh encryption of zero; the plaintext is unchanged but the
/// ciphertext becomes indistinguishable from a fresh encryption.
pub fn rerandomize(pk: &PaillierPublicKey, a: &Ciphertext, rng: &mut impl RngCore) -> Ciphertext {
    let n = pk.n();
    let n2 = pk.n2();
    let mut r = rand_below(&n, rng);
    if r == 0 {
        r.assign(1);
    }
    let ri = r.pow_mod(&n, &n2).unwrap();
    let ai = int_from_be(&a.0);
    Ciphertext(int_to_be(&((ai * ri) % n2)))
}

/// Blake3 fingerprint of a public key, for logging and pinning.
pub fn fingerprint(pk: &PaillierPublicKey) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&pk.n);
    h.update(&pk.n2);
    h.finalize().to_hex().to_string()
}

// --- Simple JSON (de)serialization helpers for keys ---

pub fn save_json<T: Serialize>(path: &str, value: &T) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

pub fn load_json<T: for<'de> Deserialize<'de>>(path: &str) -> anyhow::Result<T> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

// ------------------- Tests -------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    // Canonical modulo: returns z in [0, n-1]
    fn mod_n(mut z: Integer, n: &Integer) -> Integer {
        z %= n;
        if z.is_negative() {
            z += n;
        }
        z
    }

    #[test]
    fn paillier_add_mul_plain_roundtrip() {
        let mut rng = rand::thread_rng();
        let (pk, sk) = keygen(512, &mut rng).unwrap();
        let n = pk.n();

        for _ in 0..25 {
            let a: i64 = rng.gen_range(0..1_000_000);
            let b: i64 = rng.gen_range(0..1_000_000);
            let ca = enc(&pk, &Integer::from(a), &mut rng);
            let cb = enc(&pk, &Integer::from(b), &mut rng);
            // Homomorphic add: Dec(E(a) * E(b)) == (a + b) mod n
            let sum_dec = dec(&sk, &add(&pk, &ca, &cb)).unwrap();
            assert_eq!(sum_dec, mod_n(Integer::from(a) + Integer::from(b), &n));
            // Scalar multiply: Dec(E(a)^k) == (a * k) mod n
            let k: i64 = rng.gen_range(-1000..1000);
            let prod_dec = dec(&sk, &mul_plain(&pk, &ca, &Integer::from(k))).unwrap();
            assert_eq!(prod_dec, mod_n(Integer::from(a) * Integer::from(k), &n));
        }
    }

    #[test]
    fn rerandomize_preserves_plaintext() {
        let mut rng = rand::thread_rng();
        let (pk, sk) = keygen(512, &mut rng).unwrap();
        let m = Integer::from(424242);
        let c = enc(&pk, &m, &mut rng);
        let c2 = rerandomize(&pk, &c, &mut rng);
        assert_ne!(c.0, c2.0, "rerandomisation must change the ciphertext");
        assert_eq!(dec(&sk, &c2).unwrap(), m);
    }

    #[test]
    fn malformed_ciphertexts_are_rejected() {
        let mut rng = rand::thread_rng();
        let (pk, sk) = keygen(512, &mut rng).unwrap();
        assert!(dec(&sk, &Ciphertext(vec![])).is_err());
        let too_big = int_to_be(&pk.n2());
        assert!(dec(&sk, &Ciphertext(too_big)).is_err());
    }

    #[test]
    fn rand_below_stays_in_range() {
        let mut rng = rand::thread_rng();
        let n = Integer::from(1_000_003u64);
        for _ in 0..500 {
            let v = rand_below(&n, &mut rng);
            assert!(v >= 0 && v < n);
        }
    }

    #[test]
    fn fingerprint_distinguishes_keys() {
        let mut rng = rand::thread_rng();
        let (pk1, _) = keygen(256, &mut rng).unwrap();
        let (pk2, _) = keygen(256, &mut rng).unwrap();
        assert_eq!(fingerprint(&pk1), fingerprint(&pk1));
        assert_ne!(fingerprint(&pk1), fingerprint(&pk2));
    }
}
