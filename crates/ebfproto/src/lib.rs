//! ebfproto: wire-visible artefacts of the encrypted-filter exchange.
//!
//! The receiver ships an [`EbfPayload`] (public key, filter geometry, the
//! encrypted cells); the sender returns a [`ReplyPayload`] of combined
//! ciphertext tuples. Frames are length-prefixed bincode; the transport that
//! carries them is out of scope here.

use ebfcrypto::{Ciphertext, PaillierPublicKey};
use serde::{Deserialize, Serialize};

pub const PROTO_VER: u32 = 1;

/// Encrypted-filter payload sent receiver -> sender. Never carries the
/// private key.
///
/// `hash_seed` parameterises the default MurmurHash3 hasher; parties that
/// substitute a custom hasher agree on it out of band.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EbfPayload {
    pub proto_ver: u32,
    pub pk: PaillierPublicKey,
    pub len: u64,
    pub hashes: u32,
    pub mode: u8,
    pub hash_seed: u64,
    pub ebf: Vec<Ciphertext>,
}

/// One combined query result: a pair for union and intersection, a single
/// ciphertext for cardinality.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherTuple {
    Pair { ckey: Ciphertext, ciph: Ciphertext },
    Single(Ciphertext),
}

impl CipherTuple {
    pub fn ciphertexts(&self) -> Vec<&Ciphertext> {
        match self {
            CipherTuple::Pair { ckey, ciph } => vec![ckey, ciph],
            CipherTuple::Single(c) => vec![c],
        }
    }
}

/// Combined tuples sent sender -> receiver. Order carries no meaning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub ca: Vec<CipherTuple>,
}

/// Message envelope for the two flows of the exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Msg {
    Filter(EbfPayload),
    Reply(ReplyPayload),
}

/// Frame a message: `[u32 LE byte length][bincode payload]`.
pub fn to_frame(msg: &Msg) -> anyhow::Result<Vec<u8>> {
    let body = bincode::serialize(msg)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one frame from the front of `buf`; returns the message and the
/// number of bytes consumed.
pub fn from_frame(buf: &[u8]) -> anyhow::Result<(Msg, usize)> {
    use anyhow::bail;

    if buf.len() < 4 {
        bail!("short frame header");
    }
    let n = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + n {
        bail!("truncated frame: need {} bytes, have {}", 4 + n, buf.len());
    }
    let msg = bincode::deserialize(&buf[4..4 + n])?;
    Ok((msg, 4 + n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_payload() -> EbfPayload {
        EbfPayload {
            proto_ver: PROTO_VER,
            pk: PaillierPublicKey {
                n: vec![0x11, 0x22],
                n2: vec![0x33, 0x44],
            },
            len: 3,
            hashes: 2,
            mode: 1,
            hash_seed: 0,
            ebf: vec![
                Ciphertext(vec![1]),
                Ciphertext(vec![2]),
                Ciphertext(vec![3]),
            ],
        }
    }

    #[test]
    fn filter_frame_roundtrip() {
        let frame = to_frame(&Msg::Filter(dummy_payload())).unwrap();
        let (msg, used) = from_frame(&frame).unwrap();
        assert_eq!(used, frame.len());
        match msg {
            Msg::Filter(p) => {
                assert_eq!(p.proto_ver, PROTO_VER);
                assert_eq!(p.len, 3);
                assert_eq!(p.ebf.len(), 3);
            }
            _ => panic!("wrong envelope variant"),
        }
    }

    #[test]
    fn reply_frame_roundtrip() {
        let reply = ReplyPayload {
            ca: vec![
                CipherTuple::Pair {
                    ckey: Ciphertext(vec![9, 9]),
                    ciph: Ciphertext(vec![7]),
                },
                CipherTuple::Single(Ciphertext(vec![5])),
            ],
        };
        let frame = to_frame(&Msg::Reply(reply.clone())).unwrap();
        let (msg, _) = from_frame(&frame).unwrap();
        match msg {
            Msg::Reply(r) => assert_eq!(r, reply),
            _ => panic!("wrong envelope variant"),
        }
    }

    #[test]
    fn truncated_frames_fail() {
        let frame = to_frame(&Msg::Reply(ReplyPayload { ca: vec![] })).unwrap();
        assert!(from_frame(&frame[..2]).is_err());
        assert!(from_frame(&frame[..frame.len() - 1]).is_err());
    }
}
