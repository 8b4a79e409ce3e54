//! Crash and restart: acknowledged digests must survive, torn tails must
//! truncate cleanly, and the next round after recovery must land.

use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tidemark_calendar::CalendarStore;
use tidemark_node::aggregator::Aggregator;
use tidemark_proofs::digest::sha256;
use tidemark_proofs::{Attestation, Digest, Op, Path};

fn pending_path(steps: Vec<Op>) -> Path {
    Path::from_steps(
        steps,
        Attestation::Pending {
            uri: "http://test/".into(),
        },
    )
    .unwrap()
}

fn journal_path(dir: &std::path::Path) -> std::path::PathBuf {
    dir.join("journal").join("segment.log")
}

#[test]
fn torn_tail_truncates_and_next_commitment_lands() {
    let dir = tempdir().unwrap();
    let kept = sha256(b"kept-round");
    {
        let store = CalendarStore::open(dir.path()).unwrap();
        store.add_commitment(kept, pending_path(vec![])).unwrap();
        store
            .add_commitment(sha256(b"doomed-round"), pending_path(vec![]))
            .unwrap();
    }

    // Tear the second record roughly in half, as a crash mid-append would.
    let path = journal_path(dir.path());
    let full = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full - (full / 4)).unwrap();
    drop(file);

    let store = CalendarStore::open(dir.path()).unwrap();
    assert!(store.get(&kept).unwrap().is_some());
    assert!(store.get(&sha256(b"doomed-round")).unwrap().is_none());

    // A fresh round writes a clean record after the truncation point.
    let next = sha256(b"post-recovery-round");
    store.add_commitment(next, pending_path(vec![])).unwrap();
    let got = store.get(&next).unwrap().unwrap();
    assert_eq!(got.apply(next), next);
}

#[test]
fn every_truncation_point_recovers_a_prefix() {
    let dir = tempdir().unwrap();
    let commitments: Vec<Digest> = (0..6u8).map(|i| sha256(&[0x40, i])).collect();
    {
        let store = CalendarStore::open(dir.path()).unwrap();
        for c in &commitments {
            store
                .add_commitment(*c, pending_path(vec![Op::Append(vec![0x55; 32])]))
                .unwrap();
        }
    }
    let path = journal_path(dir.path());
    let pristine = std::fs::read(&path).unwrap();
    let index_path = dir.path().join("index").join("entries.idx");

    for cut in (0..=pristine.len()).step_by(7) {
        std::fs::write(&path, &pristine[..cut]).unwrap();
        // The index may now reference truncated records; recovery from the
        // journal alone must still work.
        let _ = std::fs::remove_file(&index_path);

        let store = CalendarStore::open(dir.path()).unwrap();
        let recovered = store.stats().commitments as usize;
        assert!(recovered <= commitments.len());

        // Prefix property: the first `recovered` rounds resolve, and every
        // resolved path still applies to its commitment.
        for (i, c) in commitments.iter().enumerate() {
            let got = store.get(c).unwrap();
            if i < recovered {
                let p = got.unwrap_or_else(|| panic!("commitment {} lost at cut {}", i, cut));
                assert!(matches!(p.attestation(), Attestation::Pending { .. }));
            } else {
                assert!(got.is_none(), "commitment {} should be gone at cut {}", i, cut);
            }
        }
    }
}

#[test]
fn acknowledged_submissions_resolve_after_restart() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let dir = tempdir().unwrap();

    let digests: Vec<Digest> = (0..4u8).map(|i| Digest([i + 1; 32])).collect();
    let paths: Vec<Path> = rt.block_on(async {
        let store = Arc::new(CalendarStore::open(dir.path()).unwrap());
        let aggregator = Aggregator::spawn(
            store,
            "http://test/".into(),
            Duration::from_millis(100),
            64,
        );
        let mut handles = Vec::new();
        for d in digests.clone() {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move { aggregator.submit(d).await.unwrap() }));
        }
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    });
    rt.shutdown_timeout(Duration::from_secs(1));

    // "Restart": reopen the calendar directory cold.
    let store = CalendarStore::open(dir.path()).unwrap();
    for (d, acknowledged) in digests.iter().zip(&paths) {
        let stored = store
            .get(d)
            .unwrap()
            .unwrap_or_else(|| panic!("digest {} lost after restart", d));
        // The stored outward path reaches the same commitment the client
        // path was built against.
        assert_eq!(stored.apply(*d), acknowledged.apply(*d));
    }
}
