//! Calendar store: journal + index composed behind one lock.
//!
//! Records come in two kinds under one shape `(digest, outward path)`:
//! round records carry a commitment (first with a pending path, later
//! upgraded with a bitcoin path), aggregated records carry a submitted
//! leaf digest with its steps up to the round commitment. The stamper
//! anchors round records only; `get` serves any indexed digest, splicing
//! a leaf's steps onto the commitment's best path at read time so a final
//! attestation reaches every digest of the round without rewriting
//! anything.

use crate::error::{CalendarError, Result};
use crate::index::Index;
use crate::journal::Journal;
use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;
use std::sync::Mutex;
use tidemark_proofs::{Attestation, Digest, Op, Path};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
enum RecordKind {
    /// A round commitment; what the stamper anchors.
    Round,
    /// A submitted digest aggregated under a round commitment.
    Aggregated,
}

#[derive(Serialize, Deserialize)]
struct JournalRecord {
    kind: RecordKind,
    digest: Digest,
    path: Path,
}

fn encode_record(kind: RecordKind, digest: Digest, path: &Path) -> Vec<u8> {
    bincode::serde::encode_to_vec(
        JournalRecord {
            kind,
            digest,
            path: path.clone(),
        },
        bincode::config::standard(),
    )
    .expect("record serialization is infallible")
}

fn decode_record(offset: u64, payload: &[u8]) -> Result<(RecordKind, Digest, Path)> {
    let (record, _): (JournalRecord, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard()).map_err(|e| {
            CalendarError::Decode {
                offset,
                message: e.to_string(),
            }
        })?;
    let path = record.path.validated()?;
    Ok((record.kind, record.digest, path))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub journal_bytes: u64,
    pub journal_records: u64,
    pub indexed_digests: usize,
    pub commitments: u64,
}

struct Inner {
    journal: Journal,
    index: Index,
    /// Latest commitment and its pending path, for `GET /tip`.
    tip: Option<(Digest, Path)>,
    commitments: u64,
}

pub struct CalendarStore {
    inner: Mutex<Inner>,
}

impl CalendarStore {
    /// Opens the store under `dir`, recovering both files and replaying
    /// the journal so that every record the journal kept is indexed.
    pub fn open(dir: impl AsRef<FsPath>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir.join("journal"))?;
        std::fs::create_dir_all(dir.join("index"))?;

        let journal = Journal::open(dir.join("journal").join("segment.log"))?;
        let mut index = Index::open(dir.join("index").join("entries.idx"), journal.len())?;

        // One pass over the journal: re-index anything a crash kept out of
        // the index, and rebuild tip + commitment count. Replaying from the
        // highest indexed offset would also do; a full scan additionally
        // covers a lost index file and keeps open() self-checking.
        let mut tip = None;
        let mut commitments = 0u64;
        let mut repaired = 0usize;
        for item in journal.iter_from(0)? {
            let (offset, payload) = item?;
            let (kind, digest, path) = decode_record(offset, &payload)?;
            let finalizes = path.is_bitcoin();
            for d in path.intermediates(digest) {
                // Same rule as the write path: a pending record never
                // steals a digest already mapped, an upgrade record takes
                // over the digests it finalizes.
                let wanted = match index.get(&d) {
                    None => true,
                    Some(existing) => finalizes && existing < offset,
                };
                if wanted {
                    index.insert(d, offset)?;
                    repaired += 1;
                }
            }
            if kind == RecordKind::Round {
                if let Attestation::Pending { .. } = path.attestation() {
                    tip = Some((digest, path));
                    commitments += 1;
                }
            }
        }
        index.sync()?;
        if repaired > 0 {
            tracing::info!(repaired, "re-indexed journal records after recovery");
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                journal,
                index,
                tip,
                commitments,
            }),
        })
    }

    /// Journals one freshly closed round. The path must end in a pending
    /// attestation; on return the record is fsync'd and every digest along
    /// it resolves through `get`.
    pub fn add_commitment(&self, commitment: Digest, path: Path) -> Result<()> {
        self.add_round(commitment, path, &[])
    }

    /// `add_commitment` plus the round's aggregated leaves, each with its
    /// steps up to the commitment. One lock, one fsync'd batch: leaves a
    /// submitter was acknowledged for stay resolvable across any restart.
    pub fn add_round(
        &self,
        commitment: Digest,
        path: Path,
        leaves: &[(Digest, Vec<Op>)],
    ) -> Result<()> {
        if path.is_bitcoin() {
            return Err(CalendarError::ExpectedPending);
        }
        let mut inner = self.lock();

        let payload = encode_record(RecordKind::Round, commitment, &path);
        let offset = inner.journal.append(&payload)?;
        index_new_record(&mut inner.index, commitment, &path, offset)?;

        for (leaf, steps) in leaves {
            // The commitment record already serves its own digest, and a
            // digest aggregated in an earlier round keeps its first record.
            if inner.index.contains(leaf) {
                continue;
            }
            let leaf_path = path.prefixed(steps)?;
            let payload = encode_record(RecordKind::Aggregated, *leaf, &leaf_path);
            let offset = inner.journal.append(&payload)?;
            index_new_record(&mut inner.index, *leaf, &leaf_path, offset)?;
        }

        inner.index.sync()?;
        inner.tip = Some((commitment, path));
        inner.commitments += 1;
        Ok(())
    }

    /// Attaches a final bitcoin attestation to a previously added
    /// commitment. Idempotent under exact re-execution; a different final
    /// path for the same commitment is an invariant violation.
    pub fn upgrade_commitment(&self, commitment: Digest, path: Path) -> Result<()> {
        if !path.is_bitcoin() {
            return Err(CalendarError::ExpectedBitcoin);
        }
        let mut inner = self.lock();

        let current = lookup(&inner.journal, &inner.index, &commitment)?
            .ok_or(CalendarError::UnknownCommitment(commitment))?;
        if current.is_bitcoin() {
            if current == path {
                return Ok(());
            }
            return Err(CalendarError::ConflictingUpgrade(commitment));
        }

        let payload = encode_record(RecordKind::Round, commitment, &path);
        let offset = inner.journal.append(&payload)?;
        for digest in path.intermediates(commitment) {
            inner.index.insert(digest, offset)?;
        }
        inner.index.sync()?;
        Ok(())
    }

    /// Best known outward path from `digest`: final if one is reachable,
    /// pending otherwise, `None` for a digest the calendar has never seen.
    pub fn get(&self, digest: &Digest) -> Result<Option<Path>> {
        let inner = self.lock();
        let Some(base) = lookup(&inner.journal, &inner.index, digest)? else {
            return Ok(None);
        };
        if base.is_bitcoin() {
            return Ok(Some(base));
        }
        // A pending path whose endpoint commitment has since been anchored
        // is extended with the commitment's final path at read time.
        let end = base.apply(*digest);
        if end != *digest {
            if let Some(final_path) = lookup(&inner.journal, &inner.index, &end)? {
                if final_path.is_bitcoin() {
                    let mut ops: Vec<Op> = base.steps().to_vec();
                    ops.extend_from_slice(final_path.ops());
                    return Ok(Some(Path::new(ops)?));
                }
            }
        }
        Ok(Some(base))
    }

    /// Latest commitment and its pending path.
    pub fn tip(&self) -> Option<(Digest, Path)> {
        self.lock().tip.clone()
    }

    /// Commitments with no stored bitcoin attestation, in journal order.
    pub fn unanchored_commitments(&self) -> Result<Vec<Digest>> {
        let inner = self.lock();
        let mut pending: Vec<Digest> = Vec::new();
        for item in inner.journal.iter_from(0)? {
            let (offset, payload) = item?;
            let (kind, digest, path) = decode_record(offset, &payload)?;
            if kind != RecordKind::Round {
                continue;
            }
            match path.attestation() {
                Attestation::Pending { .. } => {
                    if !pending.contains(&digest) {
                        pending.push(digest);
                    }
                }
                Attestation::Bitcoin { .. } => pending.retain(|c| *c != digest),
            }
        }
        Ok(pending)
    }

    /// Raw journal bytes for the backup feed, starting at `offset`.
    pub fn backup_from(&self, offset: u64) -> Result<Vec<u8>> {
        self.lock().journal.raw_from(offset)
    }

    pub fn journal_len(&self) -> u64 {
        self.lock().journal.len()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        StoreStats {
            journal_bytes: inner.journal.len(),
            journal_records: inner.journal.record_count(),
            indexed_digests: inner.index.len(),
            commitments: inner.commitments,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Indexes a freshly appended record: its digest and every intermediate,
/// never stealing a digest an earlier record already serves.
fn index_new_record(index: &mut Index, digest: Digest, path: &Path, offset: u64) -> Result<()> {
    for d in path.intermediates(digest) {
        if !index.contains(&d) {
            index.insert(d, offset)?;
        }
    }
    Ok(())
}

fn lookup(journal: &Journal, index: &Index, digest: &Digest) -> Result<Option<Path>> {
    let Some(offset) = index.get(digest) else {
        return Ok(None);
    };
    let payload = journal.read_at(offset)?;
    let (_, record_digest, path) = decode_record(offset, &payload)?;
    if record_digest == *digest {
        return Ok(Some(path));
    }
    // Indexed as an intermediate: serve the stored suffix from it onward.
    let position = path
        .intermediates(record_digest)
        .iter()
        .position(|d| d == digest)
        .ok_or(CalendarError::Unreachable {
            digest: *digest,
            offset,
        })?;
    Ok(Some(path.suffix(position)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tidemark_proofs::digest::{sha256, sha256_cat};

    fn pending_path(steps: Vec<Op>) -> Path {
        Path::from_steps(
            steps,
            Attestation::Pending {
                uri: "http://test/".into(),
            },
        )
        .unwrap()
    }

    fn bitcoin_path(steps: Vec<Op>, height: u64) -> Path {
        Path::from_steps(steps, Attestation::Bitcoin { height }).unwrap()
    }

    #[test]
    fn add_then_get_commitment() {
        let dir = tempdir().unwrap();
        let store = CalendarStore::open(dir.path()).unwrap();

        let c = sha256(b"commitment");
        store.add_commitment(c, pending_path(vec![])).unwrap();

        let got = store.get(&c).unwrap().unwrap();
        assert!(matches!(got.attestation(), Attestation::Pending { uri } if uri == "http://test/"));
        assert_eq!(got.apply(c), c);

        assert!(store.get(&sha256(b"never-seen")).unwrap().is_none());
    }

    #[test]
    fn single_leaf_round_writes_one_record() {
        let dir = tempdir().unwrap();
        let store = CalendarStore::open(dir.path()).unwrap();

        let d = sha256(b"lone");
        store
            .add_round(d, pending_path(vec![]), &[(d, vec![])])
            .unwrap();
        assert_eq!(store.stats().journal_records, 1);
        assert!(store.get(&d).unwrap().is_some());
    }

    #[test]
    fn round_leaves_resolve_and_inherit_upgrades() {
        let dir = tempdir().unwrap();
        let store = CalendarStore::open(dir.path()).unwrap();

        let a = sha256(b"leaf-a");
        let b = sha256(b"leaf-b");
        let c = sha256_cat(a.as_bytes(), b.as_bytes());
        store
            .add_round(
                c,
                pending_path(vec![]),
                &[
                    (a, vec![Op::Append(b.as_bytes().to_vec())]),
                    (b, vec![Op::Prepend(a.as_bytes().to_vec())]),
                ],
            )
            .unwrap();

        let got_a = store.get(&a).unwrap().unwrap();
        assert_eq!(got_a.apply(a), c);
        assert!(matches!(got_a.attestation(), Attestation::Pending { .. }));

        // Anchoring the commitment upgrades every leaf's answer too.
        store
            .upgrade_commitment(c, bitcoin_path(vec![Op::Append(vec![0x11; 32])], 99))
            .unwrap();
        let upgraded_a = store.get(&a).unwrap().unwrap();
        assert!(matches!(upgraded_a.attestation(), Attestation::Bitcoin { height: 99 }));
        // Leaf steps survive in front of the final tail.
        assert_eq!(upgraded_a.ops().len(), 3);
        let upgraded_b = store.get(&b).unwrap().unwrap();
        assert!(upgraded_b.is_bitcoin());
    }

    #[test]
    fn intermediates_resolve_with_suffix_paths() {
        let dir = tempdir().unwrap();
        let store = CalendarStore::open(dir.path()).unwrap();

        let c = sha256(b"commitment");
        let sibling = sha256(b"sibling");
        let path = pending_path(vec![
            Op::Append(sibling.as_bytes().to_vec()),
            Op::Prepend(sibling.as_bytes().to_vec()),
        ]);
        let mid = Op::Append(sibling.as_bytes().to_vec()).apply(&c).unwrap();
        let top = Op::Prepend(sibling.as_bytes().to_vec())
            .apply(&mid)
            .unwrap();

        store.add_commitment(c, path.clone()).unwrap();

        let from_mid = store.get(&mid).unwrap().unwrap();
        assert_eq!(from_mid.apply(mid), top);
        let from_top = store.get(&top).unwrap().unwrap();
        assert_eq!(from_top.ops().len(), 1);
    }

    #[test]
    fn upgrade_prefers_final_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = CalendarStore::open(dir.path()).unwrap();

        let c = sha256(b"round");
        store.add_commitment(c, pending_path(vec![])).unwrap();

        let upgrade = bitcoin_path(vec![Op::Append(vec![0xee; 32])], 120);
        store.upgrade_commitment(c, upgrade.clone()).unwrap();

        let got = store.get(&c).unwrap().unwrap();
        assert!(matches!(got.attestation(), Attestation::Bitcoin { height: 120 }));

        // Exact re-execution: no-op.
        store.upgrade_commitment(c, upgrade).unwrap();
        let stats = store.stats();
        assert_eq!(stats.journal_records, 2);

        // Conflicting height: loud failure.
        let conflicting = bitcoin_path(vec![Op::Append(vec![0xee; 32])], 121);
        assert!(matches!(
            store.upgrade_commitment(c, conflicting),
            Err(CalendarError::ConflictingUpgrade(_))
        ));
    }

    #[test]
    fn upgrade_unknown_commitment_fails() {
        let dir = tempdir().unwrap();
        let store = CalendarStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.upgrade_commitment(sha256(b"ghost"), bitcoin_path(vec![], 1)),
            Err(CalendarError::UnknownCommitment(_))
        ));
    }

    #[test]
    fn attestation_kind_is_enforced() {
        let dir = tempdir().unwrap();
        let store = CalendarStore::open(dir.path()).unwrap();
        let c = sha256(b"c");
        assert!(matches!(
            store.add_commitment(c, bitcoin_path(vec![], 9)),
            Err(CalendarError::ExpectedPending)
        ));
        store.add_commitment(c, pending_path(vec![])).unwrap();
        assert!(matches!(
            store.upgrade_commitment(c, pending_path(vec![])),
            Err(CalendarError::ExpectedBitcoin)
        ));
    }

    #[test]
    fn reopen_preserves_everything() {
        let dir = tempdir().unwrap();
        let c1 = sha256(b"one");
        let c2 = sha256(b"two");
        let leaf = sha256(b"leaf-of-two");
        {
            let store = CalendarStore::open(dir.path()).unwrap();
            store.add_commitment(c1, pending_path(vec![])).unwrap();
            store
                .add_round(
                    c2,
                    pending_path(vec![]),
                    &[(leaf, vec![Op::Append(vec![0x21; 32])])],
                )
                .unwrap();
            store
                .upgrade_commitment(c1, bitcoin_path(vec![], 500))
                .unwrap();
        }

        let store = CalendarStore::open(dir.path()).unwrap();
        assert!(store.get(&c1).unwrap().unwrap().is_bitcoin());
        assert!(!store.get(&c2).unwrap().unwrap().is_bitcoin());
        assert!(store.get(&leaf).unwrap().is_some());
        assert_eq!(store.tip().unwrap().0, c2);
        assert_eq!(store.unanchored_commitments().unwrap(), vec![c2]);
        assert_eq!(store.stats().commitments, 2);
    }

    #[test]
    fn index_rebuilt_when_file_lost() {
        let dir = tempdir().unwrap();
        let c = sha256(b"survivor");
        {
            let store = CalendarStore::open(dir.path()).unwrap();
            store
                .add_commitment(c, pending_path(vec![Op::Append(vec![0x44; 32])]))
                .unwrap();
        }
        std::fs::remove_file(dir.path().join("index").join("entries.idx")).unwrap();

        let store = CalendarStore::open(dir.path()).unwrap();
        let got = store.get(&c).unwrap().unwrap();
        assert_eq!(got.ops().len(), 2);
        assert!(store.stats().indexed_digests >= 2);
    }

    #[test]
    fn rebuilt_index_matches_surviving_one() {
        let dir = tempdir().unwrap();
        let c1 = sha256(b"r1");
        let c2 = sha256(b"r2");
        {
            let store = CalendarStore::open(dir.path()).unwrap();
            store.add_commitment(c1, pending_path(vec![])).unwrap();
            store
                .upgrade_commitment(c1, bitcoin_path(vec![], 7))
                .unwrap();
            store.add_commitment(c2, pending_path(vec![])).unwrap();
        }

        let with_index = CalendarStore::open(dir.path()).unwrap();
        let a1 = with_index.get(&c1).unwrap().unwrap().encode();
        let a2 = with_index.get(&c2).unwrap().unwrap().encode();
        drop(with_index);

        std::fs::remove_file(dir.path().join("index").join("entries.idx")).unwrap();
        let rebuilt = CalendarStore::open(dir.path()).unwrap();
        assert_eq!(rebuilt.get(&c1).unwrap().unwrap().encode(), a1);
        assert_eq!(rebuilt.get(&c2).unwrap().unwrap().encode(), a2);
    }

    #[test]
    fn backup_bytes_replay_into_fresh_store() {
        let source_dir = tempdir().unwrap();
        let c1 = sha256(b"alpha");
        let c2 = sha256(b"beta");
        let source = CalendarStore::open(source_dir.path()).unwrap();
        source.add_commitment(c1, pending_path(vec![])).unwrap();
        source.add_commitment(c2, pending_path(vec![])).unwrap();

        let bytes = source.backup_from(0).unwrap();

        // A downstream mirror writes the raw records into its own journal
        // file and opens a store over them.
        let mirror_dir = tempdir().unwrap();
        std::fs::create_dir_all(mirror_dir.path().join("journal")).unwrap();
        std::fs::write(
            mirror_dir.path().join("journal").join("segment.log"),
            &bytes,
        )
        .unwrap();
        let mirror = CalendarStore::open(mirror_dir.path()).unwrap();

        for c in [c1, c2] {
            assert_eq!(
                mirror.get(&c).unwrap().unwrap().encode(),
                source.get(&c).unwrap().unwrap().encode()
            );
        }
    }
}
