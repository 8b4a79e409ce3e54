// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Anchor-transaction plumbing.
//!
//! A minimal non-witness transaction model: enough to build a one-input
//! transaction whose second output is a provably-unspendable `OP_RETURN`
//! push carrying the 32-byte top digest, to serialize it to wire bytes,
//! and to split those bytes around the payload so a proof path can walk
//! from the top digest into the transaction.
//!
//! The path crosses the transaction as two hashing steps — prepend the
//! bytes before the payload, append the bytes after it — so the digest a
//! path reaches here is the fold of those two steps, not a plain hash of
//! the wire bytes. `payload_txid` is that fold; the stamper and every
//! proof consumer agree on it by construction.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidemark_proofs::digest::sha256_cat;
use tidemark_proofs::{Digest, Op};

/// nSequence value opting in to replacement.
pub const RBF_SEQUENCE: u32 = 0xffff_fffd;

const OP_RETURN: u8 = 0x6a;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction bytes truncated")]
    Truncated,
    #[error("varint too large")]
    OversizedVarint,
    #[error("trailing bytes after transaction")]
    TrailingBytes,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Digest,
    pub vout: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxOut {
    /// Value in satoshi.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TxError> {
        if self.bytes.len() - self.pos < n {
            return Err(TxError::Truncated);
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, TxError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, TxError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, TxError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn varint(&mut self) -> Result<u64, TxError> {
        match self.u8()? {
            n @ 0..=0xfc => Ok(n as u64),
            0xfd => Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as u64),
            0xfe => Ok(self.u32()? as u64),
            0xff => Ok(self.u64()?),
        }
    }
}

impl Transaction {
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_tracking(None).0
    }

    /// Serializes, and if `payload` is given also reports the byte offset
    /// where that exact 32-byte push payload starts in the output.
    fn serialize_tracking(&self, payload: Option<&Digest>) -> (Vec<u8>, Option<usize>) {
        let mut buf = Vec::with_capacity(96 + self.outputs.len() * 48);
        let mut payload_at = None;

        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(input.prevout.txid.as_bytes());
            buf.extend_from_slice(&input.prevout.vout.to_le_bytes());
            write_varint(&mut buf, input.script_sig.len() as u64);
            buf.extend_from_slice(&input.script_sig);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut buf, output.script_pubkey.len() as u64);
            if let Some(digest) = payload {
                if payload_at.is_none() && output.script_pubkey == op_return_script(digest) {
                    // Script layout is [OP_RETURN][push 32][payload].
                    payload_at = Some(buf.len() + 2);
                }
            }
            buf.extend_from_slice(&output.script_pubkey);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());

        (buf, payload_at)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, TxError> {
        let mut cur = Cursor { bytes, pos: 0 };

        let version = i32::from_le_bytes(cur.take(4)?.try_into().unwrap());
        let n_in = cur.varint()?;
        if n_in > 1024 {
            return Err(TxError::OversizedVarint);
        }
        let mut inputs = Vec::with_capacity(n_in as usize);
        for _ in 0..n_in {
            let txid = Digest::from_slice(cur.take(32)?).expect("32-byte take");
            let vout = cur.u32()?;
            let script_len = cur.varint()? as usize;
            let script_sig = cur.take(script_len)?.to_vec();
            let sequence = cur.u32()?;
            inputs.push(TxIn {
                prevout: OutPoint { txid, vout },
                script_sig,
                sequence,
            });
        }

        let n_out = cur.varint()?;
        if n_out > 1024 {
            return Err(TxError::OversizedVarint);
        }
        let mut outputs = Vec::with_capacity(n_out as usize);
        for _ in 0..n_out {
            let value = cur.u64()?;
            let script_len = cur.varint()? as usize;
            let script_pubkey = cur.take(script_len)?.to_vec();
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        let lock_time = cur.u32()?;
        if cur.pos != bytes.len() {
            return Err(TxError::TrailingBytes);
        }
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Virtual size used for feerate arithmetic. No witness data in this
    /// model, so vsize is just the serialized length.
    pub fn vsize(&self) -> u64 {
        self.serialize().len() as u64
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// The commitment payload, if one output is an `OP_RETURN` 32-byte push.
    pub fn commitment_payload(&self) -> Option<Digest> {
        self.outputs
            .iter()
            .find_map(|o| script_payload(&o.script_pubkey))
    }
}

/// `OP_RETURN <32-byte payload>` — provably unspendable.
pub fn op_return_script(payload: &Digest) -> Vec<u8> {
    let mut script = Vec::with_capacity(2 + Digest::LEN);
    script.push(OP_RETURN);
    script.push(Digest::LEN as u8);
    script.extend_from_slice(payload.as_bytes());
    script
}

pub fn script_payload(script: &[u8]) -> Option<Digest> {
    if script.len() == 2 + Digest::LEN && script[0] == OP_RETURN && script[1] == Digest::LEN as u8 {
        Digest::from_slice(&script[2..]).ok()
    } else {
        None
    }
}

/// Wire bytes split around the commitment payload: everything before it,
/// the payload itself, everything after it.
pub fn payload_segments(tx: &Transaction) -> Option<(Vec<u8>, Digest, Vec<u8>)> {
    let payload = tx.commitment_payload()?;
    let (bytes, at) = tx.serialize_tracking(Some(&payload));
    let at = at?;
    let prefix = bytes[..at].to_vec();
    let suffix = bytes[at + Digest::LEN..].to_vec();
    Some((prefix, payload, suffix))
}

/// The two hashing steps that carry the payload digest across the
/// transaction bytes.
pub fn embedding_ops(prefix: &[u8], suffix: &[u8]) -> [Op; 2] {
    [Op::Prepend(prefix.to_vec()), Op::Append(suffix.to_vec())]
}

/// Digest a proof path reaches after crossing the transaction: the fold
/// of the embedding steps over the payload.
pub fn payload_txid(prefix: &[u8], payload: &Digest, suffix: &[u8]) -> Digest {
    let mid = sha256_cat(prefix, payload.as_bytes());
    sha256_cat(mid.as_bytes(), suffix)
}

/// `payload_txid` computed from raw wire bytes, for transactions received
/// back from the wallet.
pub fn payload_txid_of(tx: &Transaction) -> Option<Digest> {
    let (prefix, payload, suffix) = payload_segments(tx)?;
    Some(payload_txid(&prefix, &payload, &suffix))
}
