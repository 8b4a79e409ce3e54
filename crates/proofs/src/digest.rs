use crate::error::ProofError;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Opaque 32-byte SHA-256 output. Every key in the calendar is one of these.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProofError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| ProofError::BadDigestLength {
            expected: Self::LEN,
            got: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = ProofError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

/// SHA-256 over a single byte string.
pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(hasher.finalize().into())
}

/// SHA-256 over the concatenation `left || right`, without an intermediate copy.
pub fn sha256_cat(left: &[u8], right: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    Digest(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let d = sha256(b"tidemark");
        let parsed: Digest = d.to_hex().parse().unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Digest::from_slice(&[0u8; 31]).is_err());
        assert!(Digest::from_slice(&[0u8; 33]).is_err());
        assert!(Digest::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn cat_matches_single_pass() {
        let a = [0x11u8; 32];
        let b = [0x22u8; 32];
        let mut joined = Vec::new();
        joined.extend_from_slice(&a);
        joined.extend_from_slice(&b);
        assert_eq!(sha256_cat(&a, &b), sha256(&joined));
    }
}
