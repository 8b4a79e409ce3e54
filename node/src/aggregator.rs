//! Round-based digest aggregation.
//!
//! Submissions land in a bounded channel; a timer task drains it once per
//! round, merkelizes the batch into a single commitment, journals that
//! commitment, and only then releases every waiting submitter with its
//! inclusion path. The journal write happening before any acknowledgement
//! is what lets a client treat its path as durable the moment it arrives.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tidemark_calendar::CalendarStore;
use tidemark_proofs::merkle::mountain_range;
use tidemark_proofs::{Attestation, Digest, Path};
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("aggregation buffer full")]
    Overloaded,
    #[error("aggregator stopped")]
    Closed,
}

struct PendingSubmission {
    digest: Digest,
    reply: oneshot::Sender<Path>,
}

/// Handle used by request handlers. Cheap to clone; all clones feed the
/// same round.
#[derive(Clone)]
pub struct Aggregator {
    queue: mpsc::Sender<PendingSubmission>,
}

impl Aggregator {
    /// Spawns the round-closer task and returns the submission handle.
    pub fn spawn(
        store: Arc<CalendarStore>,
        uri: String,
        round_interval: Duration,
        buffer_cap: usize,
    ) -> Self {
        let (queue, rx) = mpsc::channel(buffer_cap);
        tokio::spawn(round_closer(store, uri, round_interval, rx));
        Self { queue }
    }

    /// Enqueues a digest for the current round and suspends until the
    /// round closes. The returned path applies `digest` up to the round
    /// commitment and ends in the calendar's pending attestation.
    pub async fn submit(&self, digest: Digest) -> Result<Path, SubmitError> {
        let (reply, done) = oneshot::channel();
        self.queue
            .try_send(PendingSubmission { digest, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
            })?;
        metrics::increment_counter!("tidemark_digests_submitted_total");
        done.await.map_err(|_| SubmitError::Closed)
    }
}

async fn round_closer(
    store: Arc<CalendarStore>,
    uri: String,
    round_interval: Duration,
    mut rx: mpsc::Receiver<PendingSubmission>,
) {
    tracing::info!(interval = ?round_interval, "starting aggregator round closer");
    // First close one full interval from now; an immediate tick would
    // close a zero-length round.
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + round_interval,
        round_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let mut batch = Vec::new();
        while let Ok(pending) = rx.try_recv() {
            batch.push(pending);
        }
        if batch.is_empty() {
            continue;
        }

        let started = std::time::Instant::now();
        close_round(&store, &uri, batch);
        metrics::histogram!(
            "tidemark_round_close_duration_seconds",
            started.elapsed().as_secs_f64()
        );
    }
}

fn close_round(store: &CalendarStore, uri: &str, batch: Vec<PendingSubmission>) {
    let digests: Vec<Digest> = batch.iter().map(|p| p.digest).collect();
    let merkle = mountain_range(&digests).expect("round batch is non-empty");

    let pending_tail = Path::new(vec![tidemark_proofs::Op::Attest(Attestation::Pending {
        uri: uri.to_string(),
    })])
    .expect("single attestation is a valid path");

    let leaves: Vec<_> = digests
        .iter()
        .zip(&merkle.paths)
        .map(|(d, steps)| (*d, steps.clone()))
        .collect();

    // Durability before acknowledgement. Transient failures get a couple
    // of retries; anything else is unrecoverable for a storage server.
    let mut attempts = 0;
    loop {
        match store.add_round(merkle.tip, pending_tail.clone(), &leaves) {
            Ok(()) => break,
            Err(e) if !e.is_invariant_violation() && attempts < 3 => {
                attempts += 1;
                tracing::warn!(error = %e, attempts, "journal append failed, retrying");
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::error!(error = %e, commitment = %merkle.tip, "cannot journal commitment");
                std::process::exit(2);
            }
        }
    }

    metrics::increment_counter!("tidemark_rounds_closed_total");
    metrics::increment_counter!("tidemark_commitments_journaled_total");
    tracing::info!(
        digests = digests.len(),
        commitment = %merkle.tip,
        "aggregated round"
    );

    for (pending, steps) in batch.into_iter().zip(merkle.paths) {
        match pending_tail.prefixed(&steps) {
            Ok(path) => {
                // A submitter that has gone away still counted toward the
                // round; its digest stays resolvable through the journal.
                let _ = pending.reply.send(path);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to assemble inclusion path");
            }
        }
    }
}
