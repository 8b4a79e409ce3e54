use crate::digest::Digest;
use crate::error::{ProofError, Result};
use crate::op::{Attestation, Op};
use serde::{Deserialize, Serialize};

/// Ordered, non-empty sequence of operations carrying a digest outward to
/// exactly one attestation, which is always the final operation.
///
/// The constructor enforces the shape invariant; `decode` re-validates, so
/// a `Path` obtained from untrusted bytes is as trustworthy as one built
/// locally.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Path(Vec<Op>);

impl Path {
    pub fn new(ops: Vec<Op>) -> Result<Self> {
        let path = Path(ops);
        path.validate()?;
        Ok(path)
    }

    /// Builds a path from hashing steps plus a terminal attestation.
    pub fn from_steps(mut steps: Vec<Op>, attestation: Attestation) -> Result<Self> {
        steps.push(Op::Attest(attestation));
        Self::new(steps)
    }

    fn validate(&self) -> Result<()> {
        let ops = &self.0;
        if ops.is_empty() {
            return Err(ProofError::EmptyPath);
        }
        for (i, op) in ops.iter().enumerate() {
            if op.is_attestation() && i != ops.len() - 1 {
                return Err(ProofError::MisplacedAttestation(i));
            }
        }
        if !ops.last().map(Op::is_attestation).unwrap_or(false) {
            return Err(ProofError::MissingAttestation);
        }
        Ok(())
    }

    pub fn ops(&self) -> &[Op] {
        &self.0
    }

    /// Hashing steps only, attestation excluded.
    pub fn steps(&self) -> &[Op] {
        &self.0[..self.0.len() - 1]
    }

    pub fn attestation(&self) -> &Attestation {
        match self.0.last() {
            Some(Op::Attest(a)) => a,
            _ => unreachable!("validated path always ends in an attestation"),
        }
    }

    pub fn is_bitcoin(&self) -> bool {
        matches!(self.attestation(), Attestation::Bitcoin { .. })
    }

    /// Folds the hashing steps over `input`, returning the digest reached
    /// just before the attestation.
    pub fn apply(&self, input: Digest) -> Digest {
        let mut cur = input;
        for op in self.steps() {
            match op.apply(&cur) {
                Some(next) => cur = next,
                None => unreachable!("steps() excludes the attestation"),
            }
        }
        cur
    }

    /// Every digest visited while folding `input` through the hashing
    /// steps, including `input` itself.
    pub fn intermediates(&self, input: Digest) -> Vec<Digest> {
        let mut out = Vec::with_capacity(self.0.len());
        let mut cur = input;
        out.push(cur);
        for op in self.steps() {
            if let Some(next) = op.apply(&cur) {
                cur = next;
                out.push(cur);
            }
        }
        out
    }

    /// Prefixes `steps` onto this path, keeping the same attestation.
    pub fn prefixed(&self, steps: &[Op]) -> Result<Self> {
        let mut ops = Vec::with_capacity(steps.len() + self.0.len());
        ops.extend_from_slice(steps);
        ops.extend_from_slice(&self.0);
        Self::new(ops)
    }

    /// Drops the first `n` hashing steps, keeping the rest of the path.
    /// Used to answer `get` for an intermediate digest.
    pub fn suffix(&self, n: usize) -> Result<Self> {
        if n >= self.0.len() {
            return Err(ProofError::EmptyPath);
        }
        Self::new(self.0[n..].to_vec())
    }

    /// Re-checks the shape invariant. Used after deserializing a path as
    /// part of a larger structure, where `decode` was not in the loop.
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("path serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (path, _): (Path, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProofError::Decode(e.to_string()))?;
        path.validate()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256;

    fn pending() -> Attestation {
        Attestation::Pending {
            uri: "http://test/".into(),
        }
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(Path::new(vec![]), Err(ProofError::EmptyPath)));
    }

    #[test]
    fn rejects_missing_attestation() {
        let ops = vec![Op::Append(vec![1, 2, 3])];
        assert!(matches!(
            Path::new(ops),
            Err(ProofError::MissingAttestation)
        ));
    }

    #[test]
    fn rejects_interior_attestation() {
        let ops = vec![
            Op::Attest(pending()),
            Op::Append(vec![1]),
            Op::Attest(pending()),
        ];
        assert!(matches!(
            Path::new(ops),
            Err(ProofError::MisplacedAttestation(0))
        ));
    }

    #[test]
    fn attestation_only_path_applies_to_identity() {
        let path = Path::new(vec![Op::Attest(pending())]).unwrap();
        let d = sha256(b"leaf");
        assert_eq!(path.apply(d), d);
        assert_eq!(path.intermediates(d), vec![d]);
    }

    #[test]
    fn apply_walks_all_steps() {
        let sibling = sha256(b"sibling");
        let path = Path::from_steps(
            vec![Op::Append(sibling.as_bytes().to_vec())],
            pending(),
        )
        .unwrap();
        let leaf = sha256(b"leaf");
        let expected = Op::Append(sibling.as_bytes().to_vec())
            .apply(&leaf)
            .unwrap();
        assert_eq!(path.apply(leaf), expected);
        assert_eq!(path.intermediates(leaf), vec![leaf, expected]);
    }

    #[test]
    fn encode_decode_roundtrip_exact() {
        let path = Path::from_steps(
            vec![Op::Prepend(vec![0xaa; 32]), Op::Append(vec![0xbb; 7])],
            Attestation::Bitcoin { height: 812_015 },
        )
        .unwrap();
        let bytes = path.encode();
        let decoded = Path::decode(&bytes).unwrap();
        assert_eq!(path, decoded);
        assert_eq!(bytes, decoded.encode());
    }

    #[test]
    fn decode_revalidates() {
        // A bare Append with no attestation serializes fine but must not decode.
        let bogus = Path(vec![Op::Append(vec![1])]);
        let bytes = bincode::serde::encode_to_vec(&bogus, bincode::config::standard()).unwrap();
        assert!(Path::decode(&bytes).is_err());
    }

    #[test]
    fn suffix_drops_leading_steps() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let path = Path::from_steps(
            vec![
                Op::Append(b.as_bytes().to_vec()),
                Op::Prepend(a.as_bytes().to_vec()),
            ],
            pending(),
        )
        .unwrap();
        let tail = path.suffix(1).unwrap();
        assert_eq!(tail.ops().len(), 2);
        let mid = Op::Append(b.as_bytes().to_vec()).apply(&a).unwrap();
        assert_eq!(path.apply(a), tail.apply(mid));
    }
}
