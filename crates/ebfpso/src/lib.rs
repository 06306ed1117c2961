//! ebfpso: encrypted Bloom filters for private set operations.
//!
//! The receiver fills a [`StandardBloom`] over its set, then builds an
//! [`EncBloom`]: the filter is bit-inverted and encrypted cell-by-cell under
//! a fresh Paillier keypair, so the k-wise homomorphic sum of a query's cells
//! decrypts to the number of zero bits the query hits, which is zero exactly
//! on a Bloom hit. The sender buffers its elements against the encrypted cells
//! and combines each query into a ciphertext tuple whose decryption reveals
//! the union, intersection or cardinality output and nothing else.
//!
//! Semi-honest parties only; the sender must follow the combination rules.

use std::collections::HashMap;

use log::{debug, warn};
use rayon::prelude::*;
use rug::Integer;
use thiserror::Error;

use ebfbloom::{bit_positions, BloomError, BloomHasher, Murmur3_128, StandardBloom};
use ebfcrypto::{
    add, dec, enc, fingerprint, int_from_be, int_to_be, keygen, mul_plain, rand_below,
    rerandomize, Ciphertext, CryptoError, PaillierPrivateKey, PaillierPublicKey,
};
use ebfproto::{CipherTuple, EbfPayload, ReplyPayload, PROTO_VER};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
    #[error("decode failure: {0}")]
    Decode(String),
    #[error(transparent)]
    Bloom(#[from] BloomError),
    #[error("{op} requires phase {want:?} but the filter is {have:?}")]
    Phase {
        op: &'static str,
        want: Phase,
        have: Phase,
    },
    #[error("worker pool: {0}")]
    Pool(String),
}

/// Which private set operation the combined tuples encode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Union: a miss decrypts to `(Sum * y, Sum)` and yields the sender-only
    /// element `y`; a hit decrypts to `(0, 0)`.
    Psu,
    /// Intersection: a hit decrypts to `(y, 0)`; a miss hides `y` behind a
    /// uniform blinding.
    Psi,
    /// Cardinality: one ciphertext per query, zero exactly on a hit.
    Ca,
}

impl Mode {
    pub fn as_u8(self) -> u8 {
        match self {
            Mode::Psu => 0,
            Mode::Psi => 1,
            Mode::Ca => 2,
        }
    }
}

impl TryFrom<u8> for Mode {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(Mode::Psu),
            1 => Ok(Mode::Psi),
            2 => Ok(Mode::Ca),
            other => Err(Error::InvalidParameter(format!("unknown mode {other}"))),
        }
    }
}

/// Protocol phase of a filter handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    QueriesBuffered,
    Combined,
    Decrypted,
}

/// Bounded worker pool; `workers == 0` sizes to the number of cores.
fn make_pool(workers: usize) -> Result<rayon::ThreadPool, Error> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| Error::Pool(e.to_string()))
}

#[inline]
fn word_bit(words: &[u64], i: u64) -> bool {
    (words[(i / 64) as usize] >> (i % 64)) & 1 == 1
}

// ---------------- Sender side ----------------

/// Sender-side handle over a transmitted encrypted filter: public key only.
/// Buffers query keys against the encrypted cells and combines each buffered
/// query into its mode-dependent ciphertext tuple.
pub struct EbfSender {
    hasher: Box<dyn BloomHasher>,
    len: u64,
    hashes: u32,
    hash_seed: u64,
    mode: Mode,
    pk: PaillierPublicKey,
    ebf: Vec<Ciphertext>,
    idx: Vec<u64>,
    pending: HashMap<Vec<u8>, Vec<Ciphertext>>,
    ca: Vec<CipherTuple>,
    phase: Phase,
    pool: rayon::ThreadPool,
}

impl EbfSender {
    pub fn from_payload(payload: EbfPayload, workers: usize) -> Result<Self, Error> {
        if payload.hashes == 0 || payload.len == 0 {
            return Err(Error::InvalidParameter(
                "payload describes a degenerate filter".into(),
            ));
        }
        if payload.ebf.len() as u64 != payload.len {
            return Err(Error::InvalidParameter(format!(
                "payload advertises {} cells but carries {}",
                payload.len,
                payload.ebf.len()
            )));
        }
        let mode = Mode::try_from(payload.mode)?;
        Ok(EbfSender {
            hasher: Box::new(Murmur3_128::with_seed(payload.hash_seed)),
            len: payload.len,
            hashes: payload.hashes,
            hash_seed: payload.hash_seed,
            mode,
            pk: payload.pk,
            ebf: payload.ebf,
            idx: vec![0u64; payload.hashes as usize],
            pending: HashMap::new(),
            ca: Vec::new(),
            phase: Phase::Fresh,
            pool: make_pool(workers)?,
        })
    }

    pub fn set_hasher(&mut self, hasher: Box<dyn BloomHasher>) {
        self.hash_seed = hasher.seed();
        self.hasher = hasher;
    }

    /// Buffer a query key against the encrypted cells. Always reports a hit:
    /// the real answer exists only after combination and decryption.
    pub fn check(&mut self, key: &[u8]) -> Result<bool, Error> {
        if self.ebf.is_empty() {
            return Err(Error::InvalidParameter(
                "encrypted cells were cleared; rebuild the filter before querying".into(),
            ));
        }
        if int_from_be(key) >= self.pk.n() {
            return Err(Error::InvalidParameter(
                "query key does not fit the Paillier modulus".into(),
            ));
        }
        bit_positions(self.hasher.as_mut(), key, self.len, &mut self.idx)?;
        let comb: Vec<Ciphertext> = self
            .idx
            .iter()
            .map(|&i| self.ebf[i as usize].clone())
            .collect();
        self.pending.insert(key.to_vec(), comb);
        self.phase = Phase::QueriesBuffered;
        Ok(true)
    }

    /// Combine every buffered query into its ciphertext tuple and append the
    /// results to the tuple list. Entries run in parallel on the bounded
    /// pool; the merge into the list happens after the barrier.
    pub fn hom_combine(&mut self) -> Result<(), Error> {
        if self.phase != Phase::QueriesBuffered {
            return Err(Error::Phase {
                op: "hom_combine",
                want: Phase::QueriesBuffered,
                have: self.phase,
            });
        }
        let entries: Vec<(Vec<u8>, Vec<Ciphertext>)> = self.pending.drain().collect();
        let pk = &self.pk;
        let mode = self.mode;
        let combined: Result<Vec<CipherTuple>, Error> = self.pool.install(|| {
            entries
                .par_iter()
                .map(|(key, comb)| combine_one(pk, mode, key, comb))
                .collect()
        });
        self.ca.extend(combined?);
        self.phase = Phase::Combined;
        Ok(())
    }

    /// The combined tuples, to be returned to the receiver. Order carries no
    /// meaning.
    pub fn reply(&self) -> Result<ReplyPayload, Error> {
        if self.phase != Phase::Combined {
            return Err(Error::Phase {
                op: "reply",
                want: Phase::Combined,
                have: self.phase,
            });
        }
        Ok(ReplyPayload {
            ca: self.ca.clone(),
        })
    }

    /// Drop the encrypted cells, buffered queries and combined tuples.
    pub fn reset(&mut self) {
        self.ebf.clear();
        self.pending.clear();
        self.ca.clear();
        self.hasher.reset();
        self.phase = Phase::Fresh;
    }

    pub fn public_key(&self) -> &PaillierPublicKey {
        &self.pk
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tuples(&self) -> &[CipherTuple] {
        &self.ca
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// One query's tuple. `sum` decrypts to the number of zero bits the key hits
/// in the plaintext filter, so it is zero exactly on a Bloom hit.
fn combine_one(
    pk: &PaillierPublicKey,
    mode: Mode,
    key: &[u8],
    comb: &[Ciphertext],
) -> Result<CipherTuple, Error> {
    let mut rng = rand::thread_rng();
    let mut cells = comb.iter();
    let mut sum = cells
        .next()
        .ok_or_else(|| Error::InvalidParameter("query gathered no cells".into()))?
        .clone();
    for c in cells {
        sum = add(pk, &sum, c);
    }
    let y = int_from_be(key);
    Ok(match mode {
        Mode::Psu => {
            let ckey = rerandomize(pk, &mul_plain(pk, &sum, &y), &mut rng);
            let ciph = rerandomize(pk, &sum, &mut rng);
            CipherTuple::Pair { ckey, ciph }
        }
        Mode::Psi => {
            let r = rand_below(&pk.n(), &mut rng);
            let ckey = add(pk, &mul_plain(pk, &sum, &r), &enc(pk, &y, &mut rng));
            CipherTuple::Pair { ckey, ciph: sum }
        }
        Mode::Ca => {
            let r = rand_below(&pk.n(), &mut rng);
            CipherTuple::Single(mul_plain(pk, &sum, &r))
        }
    })
}

// ---------------- Receiver side ----------------

/// Receiver-side encrypted filter: owns the private key and a plaintext copy
/// of the bit array (kept for self-tests only). Embeds a sender handle so a
/// single-process harness drives the exact code path a remote sender would.
pub struct EncBloom {
    fp_rate: f64,
    capacity: u64,
    bits: Vec<u64>,
    sk: PaillierPrivateKey,
    sender: EbfSender,
}

impl EncBloom {
    /// Encrypt `sbf` under a fresh Paillier keypair of `key_bits` bits.
    /// Encryption of the L cells runs on a bounded pool of `workers` threads
    /// (`0` = number of cores); each worker writes a disjoint cell.
    pub fn new(
        sbf: &StandardBloom,
        key_bits: u32,
        mode: Mode,
        workers: usize,
    ) -> Result<Self, Error> {
        let params = sbf.params();
        let mut rng = rand::thread_rng();
        let (pk, sk) = keygen(key_bits, &mut rng)?;
        let bits: Vec<u64> = sbf.words().to_vec();
        let hasher = sbf.clone_hasher();
        let hash_seed = hasher.seed();
        let pool = make_pool(workers)?;

        // Invert before encrypting: a set bit becomes Enc(0) and a clear bit
        // Enc(1), so the k-wise sum of a query is zero exactly on a hit.
        let ebf: Vec<Ciphertext> = pool.install(|| {
            (0..params.len as usize)
                .into_par_iter()
                .map(|i| {
                    let m = if word_bit(&bits, i as u64) {
                        Integer::new()
                    } else {
                        Integer::from(1)
                    };
                    enc(&pk, &m, &mut rand::thread_rng())
                })
                .collect()
        });

        debug!(
            "encrypted filter built: L={} k={} mode={:?} pk={}",
            params.len,
            params.hashes,
            mode,
            fingerprint(&pk)
        );

        Ok(EncBloom {
            fp_rate: params.fp_rate,
            capacity: params.capacity,
            bits,
            sk,
            sender: EbfSender {
                hasher,
                len: params.len,
                hashes: params.hashes,
                hash_seed,
                mode,
                pk,
                ebf,
                idx: vec![0u64; params.hashes as usize],
                pending: HashMap::new(),
                ca: Vec::new(),
                phase: Phase::Fresh,
                pool,
            },
        })
    }

    /// Insertion into an encrypted filter is not possible; warns and leaves
    /// the filter untouched.
    pub fn add(&mut self, _key: &[u8]) -> &mut Self {
        warn!("add on an encrypted bloom filter is a no-op; rebuild from a standard filter");
        self
    }

    pub fn set_hasher(&mut self, hasher: Box<dyn BloomHasher>) {
        self.sender.set_hasher(hasher);
    }

    pub fn check(&mut self, key: &[u8]) -> Result<bool, Error> {
        self.sender.check(key)
    }

    pub fn hom_combine(&mut self) -> Result<(), Error> {
        self.sender.hom_combine()
    }

    /// Decrypt the local tuple list into big-endian plaintext bytes, one
    /// inner list per tuple.
    pub fn decrypt(&mut self) -> Result<Vec<Vec<Vec<u8>>>, Error> {
        if self.sender.phase != Phase::Combined {
            return Err(Error::Phase {
                op: "decrypt",
                want: Phase::Combined,
                have: self.sender.phase,
            });
        }
        let out = decrypt_tuples(&self.sk, &self.sender.ca)?;
        self.sender.phase = Phase::Decrypted;
        Ok(out)
    }

    /// Decrypt a reply returned by a remote sender. Stateless: the local
    /// phase and tuple list are untouched.
    pub fn decrypt_reply(&self, reply: &ReplyPayload) -> Result<Vec<Vec<Vec<u8>>>, Error> {
        decrypt_tuples(&self.sk, &reply.ca)
    }

    /// Transmittable view of the filter: everything the sender needs, never
    /// the private key.
    pub fn view(&self) -> EbfPayload {
        EbfPayload {
            proto_ver: PROTO_VER,
            pk: self.sender.pk.clone(),
            len: self.sender.len,
            hashes: self.sender.hashes,
            mode: self.sender.mode.as_u8(),
            hash_seed: self.sender.hash_seed,
            ebf: self.sender.ebf.clone(),
        }
    }

    /// Clear the encrypted cells, buffered queries, tuple list and the
    /// retained plaintext copy.
    pub fn reset(&mut self) {
        self.bits.clear();
        self.sender.reset();
    }

    /// Self-test: decrypt every cell and compare against the inverted bit of
    /// the retained plaintext copy.
    pub fn verify_encryption(&self) -> Result<bool, Error> {
        for (i, c) in self.sender.ebf.iter().enumerate() {
            let m = dec(&self.sk, c)?;
            let want = if word_bit(&self.bits, i as u64) { 0 } else { 1 };
            if m != want {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn public_key(&self) -> &PaillierPublicKey {
        &self.sender.pk
    }

    pub fn mode(&self) -> Mode {
        self.sender.mode
    }

    pub fn phase(&self) -> Phase {
        self.sender.phase
    }

    pub fn tuples(&self) -> &[CipherTuple] {
        &self.sender.ca
    }

    /// Log the filter geometry and protocol state (debugging aid).
    pub fn dump_params(&self) {
        debug!(
            "EncBloom eps={} n={} L={} k={} mode={:?} phase={:?} cells={} pending={} tuples={} pk={}",
            self.fp_rate,
            self.capacity,
            self.sender.len,
            self.sender.hashes,
            self.sender.mode,
            self.sender.phase,
            self.sender.ebf.len(),
            self.sender.pending.len(),
            self.sender.ca.len(),
            fingerprint(&self.sender.pk),
        );
    }
}

fn decrypt_tuples(
    sk: &PaillierPrivateKey,
    ca: &[CipherTuple],
) -> Result<Vec<Vec<Vec<u8>>>, Error> {
    ca.iter()
        .map(|t| {
            t.ciphertexts()
                .into_iter()
                .map(|c| Ok(int_to_be(&dec(sk, c)?)))
                .collect()
        })
        .collect()
}

/// Union read-off: a decrypted pair `(m0, m1) = (Sum * y, Sum)` with nonzero
/// `m1` yields the sender-only element `y = m0 * m1^-1 mod N`.
pub fn recover_union_element(n: &Integer, m0: &[u8], m1: &[u8]) -> Result<Vec<u8>, Error> {
    let inv = int_from_be(m1)
        .invert(n)
        .map_err(|_| Error::Decode("combined sum is not invertible modulo N".into()))?;
    Ok(int_to_be(&((int_from_be(m0) * inv) % n)))
}

// ------------------- Tests -------------------
