//! Merkle mountain range over an ordered set of digests.
//!
//! Adjacent pairs are combined level by level; an odd trailing node is
//! carried up unchanged, and the surviving peaks fold into a single tip.
//! The construction is deterministic in submission order: the aggregator
//! and the stamper share this code so a round's commitment and an anchor's
//! top digest can never disagree for the same inputs.

use crate::digest::{sha256_cat, Digest};
use crate::op::Op;

/// Result of merkelizing one batch: the tip digest plus, for each input
/// leaf, the exact operation sequence carrying it to the tip.
#[derive(Debug, Clone)]
pub struct MerkleBatch {
    pub tip: Digest,
    pub paths: Vec<Vec<Op>>,
}

struct Node {
    digest: Digest,
    /// Indices of the leaves underneath this node.
    leaves: Vec<usize>,
}

/// Builds the mountain range over `leaves`. Returns `None` for an empty
/// input: an empty round produces no commitment.
pub fn mountain_range(leaves: &[Digest]) -> Option<MerkleBatch> {
    if leaves.is_empty() {
        return None;
    }

    let mut paths: Vec<Vec<Op>> = vec![Vec::new(); leaves.len()];
    let mut level: Vec<Node> = leaves
        .iter()
        .enumerate()
        .map(|(i, d)| Node {
            digest: *d,
            leaves: vec![i],
        })
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        let mut iter = level.into_iter();
        while let Some(left) = iter.next() {
            match iter.next() {
                Some(right) => {
                    for &leaf in &left.leaves {
                        paths[leaf].push(Op::Append(right.digest.as_bytes().to_vec()));
                    }
                    for &leaf in &right.leaves {
                        paths[leaf].push(Op::Prepend(left.digest.as_bytes().to_vec()));
                    }
                    let mut leaves = left.leaves;
                    leaves.extend(right.leaves);
                    next.push(Node {
                        digest: sha256_cat(left.digest.as_bytes(), right.digest.as_bytes()),
                        leaves,
                    });
                }
                // Odd node out: carried to the next level unchanged.
                None => next.push(left),
            }
        }
        level = next;
    }

    Some(MerkleBatch {
        tip: level[0].digest,
        paths,
    })
}

/// Inclusion path for `index` inside an ordered transaction list, using the
/// block convention of duplicating a trailing odd element. Returns the
/// reconstructed root together with the operations from the indexed entry
/// up to it.
pub fn block_inclusion_path(txids: &[Digest], index: usize) -> Option<(Digest, Vec<Op>)> {
    if index >= txids.len() {
        return None;
    }

    let mut ops = Vec::new();
    let mut level: Vec<Digest> = txids.to_vec();
    let mut idx = index;

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        let sibling = level[idx ^ 1];
        if idx % 2 == 0 {
            ops.push(Op::Append(sibling.as_bytes().to_vec()));
        } else {
            ops.push(Op::Prepend(sibling.as_bytes().to_vec()));
        }
        level = level
            .chunks(2)
            .map(|pair| sha256_cat(pair[0].as_bytes(), pair[1].as_bytes()))
            .collect();
        idx /= 2;
    }

    Some((level[0], ops))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256;

    fn apply_ops(input: Digest, ops: &[Op]) -> Digest {
        let mut cur = input;
        for op in ops {
            cur = op.apply(&cur).expect("hashing op");
        }
        cur
    }

    fn leaf(byte: u8) -> Digest {
        Digest([byte; 32])
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(mountain_range(&[]).is_none());
    }

    #[test]
    fn single_leaf_is_its_own_tip() {
        let d = leaf(0xaa);
        let batch = mountain_range(&[d]).unwrap();
        assert_eq!(batch.tip, d);
        assert_eq!(batch.paths, vec![Vec::<Op>::new()]);
    }

    #[test]
    fn two_leaves_single_peak() {
        let a = leaf(0xaa);
        let b = leaf(0xbb);
        let batch = mountain_range(&[a, b]).unwrap();
        assert_eq!(batch.tip, sha256_cat(a.as_bytes(), b.as_bytes()));
        assert_eq!(batch.paths[0], vec![Op::Append(b.as_bytes().to_vec())]);
        assert_eq!(batch.paths[1], vec![Op::Prepend(a.as_bytes().to_vec())]);
    }

    #[test]
    fn three_leaves_bag_odd_peak() {
        let (a, b, c) = (leaf(0x11), leaf(0x22), leaf(0x33));
        let pair = sha256_cat(a.as_bytes(), b.as_bytes());
        let expected_tip = sha256_cat(pair.as_bytes(), c.as_bytes());

        let batch = mountain_range(&[a, b, c]).unwrap();
        assert_eq!(batch.tip, expected_tip);
        // The odd leaf reaches the tip in a single prepend of the first peak.
        assert_eq!(batch.paths[2], vec![Op::Prepend(pair.as_bytes().to_vec())]);
        for (i, d) in [a, b, c].iter().enumerate() {
            assert_eq!(apply_ops(*d, &batch.paths[i]), expected_tip, "leaf {}", i);
        }
    }

    #[test]
    fn every_path_reaches_the_tip() {
        for n in 1..=9usize {
            let leaves: Vec<Digest> = (0..n).map(|i| sha256(&[i as u8])).collect();
            let batch = mountain_range(&leaves).unwrap();
            for (i, d) in leaves.iter().enumerate() {
                assert_eq!(
                    apply_ops(*d, &batch.paths[i]),
                    batch.tip,
                    "{} leaves, leaf {}",
                    n,
                    i
                );
            }
        }
    }

    #[test]
    fn determinism_across_calls() {
        let leaves: Vec<Digest> = (0..7u8).map(|i| sha256(&[i])).collect();
        let a = mountain_range(&leaves).unwrap();
        let b = mountain_range(&leaves).unwrap();
        assert_eq!(a.tip, b.tip);
        assert_eq!(a.paths, b.paths);
    }

    #[test]
    fn order_matters() {
        let leaves: Vec<Digest> = (0..4u8).map(|i| sha256(&[i])).collect();
        let mut swapped = leaves.clone();
        swapped.swap(0, 1);
        assert_ne!(
            mountain_range(&leaves).unwrap().tip,
            mountain_range(&swapped).unwrap().tip
        );
    }

    #[test]
    fn block_path_reconstructs_root() {
        for n in 1..=8usize {
            let txids: Vec<Digest> = (0..n).map(|i| sha256(&[0xf0, i as u8])).collect();
            let (root, _) = block_inclusion_path(&txids, 0).unwrap();
            for idx in 0..n {
                let (r, ops) = block_inclusion_path(&txids, idx).unwrap();
                assert_eq!(r, root, "root mismatch for index {} of {}", idx, n);
                assert_eq!(apply_ops(txids[idx], &ops), root);
            }
        }
    }

    #[test]
    fn block_path_out_of_range() {
        let txids = vec![leaf(1)];
        assert!(block_inclusion_path(&txids, 1).is_none());
    }
}
