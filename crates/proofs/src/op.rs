use crate::digest::{sha256_cat, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal assertion about where a digest is committed.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Attestation {
    /// The digest is enqueued at the calendar reachable at `uri`, awaiting
    /// an on-chain anchor.
    Pending { uri: String },
    /// The digest appears under the anchor transaction mined at `height`.
    Bitcoin { height: u64 },
}

impl fmt::Display for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attestation::Pending { uri } => write!(f, "pending({})", uri),
            Attestation::Bitcoin { height } => write!(f, "bitcoin({})", height),
        }
    }
}

/// One deterministic step in a proof path.
///
/// `Prepend` and `Append` hash sibling context onto the running digest;
/// `Attest` terminates the path. Payloads are byte strings rather than bare
/// digests: merkle steps carry 32-byte siblings, transaction-embedding
/// steps carry arbitrary tx fragments.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Op {
    /// output = SHA256(prefix || input)
    Prepend(Vec<u8>),
    /// output = SHA256(input || suffix)
    Append(Vec<u8>),
    Attest(Attestation),
}

impl Op {
    /// Applies this operation to `input`. Returns `None` for `Attest`,
    /// which produces no further digest.
    pub fn apply(&self, input: &Digest) -> Option<Digest> {
        match self {
            Op::Prepend(prefix) => Some(sha256_cat(prefix, input.as_bytes())),
            Op::Append(suffix) => Some(sha256_cat(input.as_bytes(), suffix)),
            Op::Attest(_) => None,
        }
    }

    pub fn is_attestation(&self) -> bool {
        matches!(self, Op::Attest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256;

    #[test]
    fn prepend_and_append_disagree() {
        let input = sha256(b"input");
        let sibling = sha256(b"sibling");
        let left = Op::Prepend(sibling.as_bytes().to_vec()).apply(&input).unwrap();
        let right = Op::Append(sibling.as_bytes().to_vec()).apply(&input).unwrap();
        assert_ne!(left, right);
    }

    #[test]
    fn attest_yields_no_digest() {
        let input = sha256(b"input");
        let op = Op::Attest(Attestation::Bitcoin { height: 42 });
        assert!(op.apply(&input).is_none());
    }

    #[test]
    fn pair_order_matches_concatenation() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        // H(a || b) reached from either side of the pair.
        let via_left = Op::Append(b.as_bytes().to_vec()).apply(&a).unwrap();
        let via_right = Op::Prepend(a.as_bytes().to_vec()).apply(&b).unwrap();
        assert_eq!(via_left, via_right);
    }
}
