// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Anchoring state machine.
//!
//! One in-flight anchor at a time: collect the commitments journaled since
//! the last anchor, merkelize them into a top digest, embed that digest in
//! an `OP_RETURN` output, broadcast, watch confirmations (bumping the fee
//! by replacement when the estimate outruns what we paid), and once the
//! settlement threshold is reached write a bitcoin attestation back into
//! the calendar for every commitment in the batch.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tidemark_calendar::{CalendarError, CalendarStore};
use tidemark_proofs::merkle::{block_inclusion_path, mountain_range};
use tidemark_proofs::{Attestation, Digest, Op, Path};

use crate::bitcoin::{
    embedding_ops, op_return_script, payload_segments, payload_txid_of, Transaction, TxIn, TxOut,
    RBF_SEQUENCE,
};
use crate::config::CalendarConfig;
use crate::rpc::{NodeRpc, RpcError, Unspent};

/// Smallest change output we will create, in satoshi.
const DUST_FLOOR: u64 = 546;
/// Room left for the wallet's signature when estimating size for fees.
const SIGNATURE_ALLOWANCE: u64 = 110;
/// Longest backoff after repeated anchor failures.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum StamperError {
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),
    #[error("calendar: {0}")]
    Calendar(#[from] CalendarError),
    #[error("wallet has no spendable output")]
    NoSpendableOutput,
    #[error("fee {fee} sat would exceed the configured cap {cap} sat")]
    FeeCapExceeded { fee: u64, cap: u64 },
    #[error("anchor transaction lost its commitment output")]
    MissingPayload,
    #[error("anchor txid not present in confirmation block")]
    NotInBlock,
}

impl StamperError {
    fn is_temporary(&self) -> bool {
        match self {
            StamperError::Rpc(e) => e.is_temporary(),
            StamperError::NotInBlock => true,
            _ => false,
        }
    }
}

struct InflightAnchor {
    tx: Transaction,
    /// txid the node reports the broadcast under.
    txid: Digest,
    top: Digest,
    commitments: Vec<Digest>,
    leaf_paths: Vec<Vec<Op>>,
    fee: u64,
    /// sat/vB actually paid; 0 when unknown (resumed after a restart).
    feerate: u64,
    broadcast_at: Instant,
}

enum AnchorState {
    Idle,
    Confirming(InflightAnchor),
}

pub struct Stamper {
    store: Arc<CalendarStore>,
    rpc: Arc<dyn NodeRpc>,
    cfg: CalendarConfig,
    state: AnchorState,
    last_anchor: Option<Instant>,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

impl Stamper {
    pub fn new(store: Arc<CalendarStore>, rpc: Arc<dyn NodeRpc>, cfg: CalendarConfig) -> Self {
        Self {
            store,
            rpc,
            cfg,
            state: AnchorState::Idle,
            last_anchor: None,
            consecutive_failures: 0,
            backoff_until: None,
        }
    }

    /// Startup discovery: if the wallet holds an unconfirmed (or recently
    /// confirmed) transaction carrying the merkle top of the currently
    /// unanchored commitments, adopt it and resume in the confirming
    /// state instead of double-spending a fresh anchor next to it.
    pub async fn recover(&mut self) -> Result<(), StamperError> {
        let pending = self.store.unanchored_commitments()?;
        tracing::info!(pending = pending.len(), "stamper recovery scan");
        if pending.is_empty() {
            return Ok(());
        }
        let merkle = mountain_range(&pending).expect("pending set is non-empty");

        for wallet_tx in self.rpc.recent_wallet_txs().await? {
            let Ok(tx) = Transaction::deserialize(&wallet_tx.raw) else {
                continue;
            };
            if tx.commitment_payload() != Some(merkle.tip) {
                continue;
            }
            tracing::info!(
                txid = %wallet_tx.txid,
                confirmations = wallet_tx.confirmations,
                "resuming in-flight anchor found in wallet"
            );
            self.state = AnchorState::Confirming(InflightAnchor {
                txid: wallet_tx.txid,
                top: merkle.tip,
                commitments: pending,
                leaf_paths: merkle.paths,
                tx,
                // Unknown without the prevout; zero disables replacement
                // until this anchor either confirms or is rebuilt.
                fee: 0,
                feerate: 0,
                broadcast_at: Instant::now(),
            });
            return Ok(());
        }
        Ok(())
    }

    /// Runs forever. Errors are absorbed into backoff; the loop itself
    /// never unwinds.
    pub async fn run(mut self) {
        tracing::info!("starting stamper loop");
        loop {
            if let Err(e) = self.tick().await {
                if e.is_temporary() {
                    tracing::warn!(error = %e, "stamper tick failed, will retry");
                } else {
                    tracing::error!(error = %e, "anchor attempt failed, backing off");
                    self.fail_backoff();
                }
            }
            tokio::time::sleep(self.cfg.stamper_poll_interval).await;
        }
    }

    async fn tick(&mut self) -> Result<(), StamperError> {
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return Ok(());
            }
            self.backoff_until = None;
        }

        match &self.state {
            AnchorState::Idle => {
                if self.anchor_due() {
                    self.try_build_anchor().await?;
                }
                Ok(())
            }
            AnchorState::Confirming(_) => self.poll_confirming().await,
        }
    }

    fn anchor_due(&self) -> bool {
        self.last_anchor
            .map_or(true, |t| t.elapsed() >= self.cfg.anchor_interval)
    }

    fn fail_backoff(&mut self) {
        self.consecutive_failures += 1;
        let delay = self
            .cfg
            .stamper_poll_interval
            .saturating_mul(1 << self.consecutive_failures.min(8))
            .min(MAX_BACKOFF);
        self.backoff_until = Some(Instant::now() + delay);
    }

    // Idle -> Building -> Broadcast -> Confirming.
    async fn try_build_anchor(&mut self) -> Result<(), StamperError> {
        let commitments = self.store.unanchored_commitments()?;
        if commitments.is_empty() {
            return Ok(());
        }
        let merkle = mountain_range(&commitments).expect("commitment set is non-empty");
        let top = merkle.tip;
        tracing::info!(commitments = commitments.len(), top = %top, "building anchor");

        let mut spendable = self.rpc.list_spendable().await?;
        spendable.sort_by_key(|u| u.value);
        let funding = spendable.pop().ok_or(StamperError::NoSpendableOutput)?;
        let change_script = self.rpc.change_script().await?;

        let estimate = self
            .rpc
            .estimate_feerate(self.cfg.confirmation_target)
            .await?;
        let mut feerate = estimate.max(self.cfg.min_relay_feerate);

        // The mempool can still want more than the estimator said; retry
        // at doubled feerates until accepted or the cap says stop.
        let (signed, txid, fee) = loop {
            let (unsigned, fee) = build_anchor_tx(&funding, &change_script, &top, feerate)?;
            if fee > self.cfg.max_fee {
                return Err(StamperError::FeeCapExceeded {
                    fee,
                    cap: self.cfg.max_fee,
                });
            }
            let signed = self.rpc.sign_transaction(&unsigned).await?;
            if signed.commitment_payload() != Some(top) {
                return Err(StamperError::MissingPayload);
            }
            match self.broadcast_with_retry(&signed).await {
                Ok(txid) => break (signed, txid, fee),
                Err(StamperError::Rpc(e)) if e.wants_higher_fee() => {
                    tracing::debug!(feerate, "fee too low for mempool, doubling");
                    feerate *= 2;
                }
                Err(e) => return Err(e),
            }
        };

        metrics::increment_counter!("tidemark_anchors_broadcast_total");
        tracing::info!(txid = %txid, fee, feerate, "anchor broadcast");
        self.consecutive_failures = 0;
        self.state = AnchorState::Confirming(InflightAnchor {
            tx: signed,
            txid,
            top,
            commitments,
            leaf_paths: merkle.paths,
            fee,
            feerate,
            broadcast_at: Instant::now(),
        });
        Ok(())
    }

    async fn broadcast_with_retry(&self, tx: &Transaction) -> Result<Digest, StamperError> {
        let mut delay = Duration::from_millis(250);
        let mut attempts = 0;
        loop {
            match self.rpc.broadcast(tx).await {
                Ok(txid) => return Ok(txid),
                Err(e) if e.is_temporary() && attempts < 5 => {
                    attempts += 1;
                    tracing::warn!(error = %e, attempts, "broadcast failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn poll_confirming(&mut self) -> Result<(), StamperError> {
        let AnchorState::Confirming(anchor) = &self.state else {
            return Ok(());
        };

        let status = self.rpc.tx_status(&anchor.txid).await?;
        match status {
            Some(status) if status.confirmations >= self.cfg.min_confirmations => {
                let block_hash = status.block_hash.ok_or(StamperError::NotInBlock)?;
                self.finalize(block_hash).await
            }
            Some(_) | None => {
                // Still in (or lost from) the mempool; consider bumping.
                if anchor.broadcast_at.elapsed() >= self.cfg.replace_after {
                    self.try_replace().await?;
                }
                Ok(())
            }
        }
    }

    // Replacement: same outpoint, same payload, strictly more fee at a
    // strictly higher feerate.
    async fn try_replace(&mut self) -> Result<(), StamperError> {
        let AnchorState::Confirming(anchor) = &mut self.state else {
            return Ok(());
        };

        // A resumed anchor has an unknown baseline; without it a strict
        // fee and feerate improvement cannot be guaranteed, so hold.
        if anchor.feerate == 0 {
            return Ok(());
        }
        let estimate = self
            .rpc
            .estimate_feerate(self.cfg.confirmation_target)
            .await?;
        if estimate <= anchor.feerate {
            return Ok(());
        }

        let funding_value = anchor.fee + anchor.tx.total_output_value();
        let vsize = anchor.tx.vsize() + SIGNATURE_ALLOWANCE;
        let new_feerate = estimate.max(anchor.feerate + 1);
        let mut new_fee = new_feerate * vsize;
        if new_fee <= anchor.fee {
            new_fee = anchor.fee + self.cfg.min_relay_feerate * vsize;
        }
        if new_fee > self.cfg.max_fee {
            // Policy cap: keep waiting at the old fee rather than overpay.
            tracing::warn!(
                new_fee,
                cap = self.cfg.max_fee,
                "replacement would exceed fee cap, holding current anchor"
            );
            return Ok(());
        }
        if funding_value < new_fee + DUST_FLOOR {
            tracing::warn!("not enough input value for a fee bump, holding current anchor");
            return Ok(());
        }

        let change_script = anchor.tx.outputs[0].script_pubkey.clone();
        let replacement = Transaction {
            version: 2,
            inputs: vec![TxIn {
                prevout: anchor.tx.inputs[0].prevout,
                script_sig: Vec::new(),
                sequence: RBF_SEQUENCE,
            }],
            outputs: vec![
                TxOut {
                    value: funding_value - new_fee,
                    script_pubkey: change_script,
                },
                TxOut {
                    value: 0,
                    script_pubkey: op_return_script(&anchor.top),
                },
            ],
            lock_time: anchor.tx.lock_time,
        };

        let signed = self.rpc.sign_transaction(&replacement).await?;
        if signed.commitment_payload() != Some(anchor.top) {
            return Err(StamperError::MissingPayload);
        }
        let txid = self.rpc.broadcast(&signed).await?;

        metrics::increment_counter!("tidemark_anchors_broadcast_total");
        tracing::info!(
            old_txid = %anchor.txid,
            new_txid = %txid,
            old_fee = anchor.fee,
            new_fee,
            new_feerate,
            "anchor replaced with higher fee"
        );
        anchor.tx = signed;
        anchor.txid = txid;
        anchor.fee = new_fee;
        anchor.feerate = new_feerate;
        anchor.broadcast_at = Instant::now();
        Ok(())
    }

    // Confirmed: stitch every commitment through the transaction and the
    // block, then return to idle.
    async fn finalize(&mut self, block_hash: Digest) -> Result<(), StamperError> {
        let AnchorState::Confirming(anchor) = &self.state else {
            return Ok(());
        };

        let height = self.rpc.block_height(&block_hash).await?;
        let txids = self.rpc.block_txids(&block_hash).await?;
        let model_txid = payload_txid_of(&anchor.tx).ok_or(StamperError::MissingPayload)?;
        let position = txids
            .iter()
            .position(|t| *t == model_txid || *t == anchor.txid)
            .ok_or(StamperError::NotInBlock)?;
        let (_root, block_ops) =
            block_inclusion_path(&txids, position).ok_or(StamperError::NotInBlock)?;

        let (prefix, _, suffix) =
            payload_segments(&anchor.tx).ok_or(StamperError::MissingPayload)?;

        for (commitment, leaf_steps) in anchor.commitments.iter().zip(&anchor.leaf_paths) {
            let mut ops: Vec<Op> = Vec::with_capacity(leaf_steps.len() + block_ops.len() + 3);
            ops.extend_from_slice(leaf_steps);
            ops.extend(embedding_ops(&prefix, &suffix));
            ops.extend_from_slice(&block_ops);
            ops.push(Op::Attest(Attestation::Bitcoin { height }));
            let path = Path::new(ops).expect("assembled upgrade path is well-formed");

            match self.store.upgrade_commitment(*commitment, path) {
                Ok(()) => {}
                Err(e @ CalendarError::ConflictingUpgrade(_)) => {
                    // The calendar already holds a different final proof:
                    // on-disk state contradicts the chain we just read.
                    tracing::error!(error = %e, commitment = %commitment, "conflicting upgrade");
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            }
        }

        metrics::increment_counter!("tidemark_anchors_confirmed_total");
        tracing::info!(
            height,
            commitments = anchor.commitments.len(),
            txid = %anchor.txid,
            "anchor confirmed, attestations published"
        );
        self.state = AnchorState::Idle;
        self.last_anchor = Some(Instant::now());
        self.consecutive_failures = 0;
        Ok(())
    }
}

fn build_anchor_tx(
    funding: &Unspent,
    change_script: &[u8],
    top: &Digest,
    feerate: u64,
) -> Result<(Transaction, u64), StamperError> {
    let mut tx = Transaction {
        version: 2,
        inputs: vec![TxIn {
            prevout: funding.outpoint,
            script_sig: Vec::new(),
            sequence: RBF_SEQUENCE,
        }],
        outputs: vec![
            TxOut {
                value: funding.value,
                script_pubkey: change_script.to_vec(),
            },
            TxOut {
                value: 0,
                script_pubkey: op_return_script(top),
            },
        ],
        lock_time: 0,
    };

    let fee = feerate * (tx.vsize() + SIGNATURE_ALLOWANCE);
    if funding.value < fee + DUST_FLOOR {
        return Err(StamperError::NoSpendableOutput);
    }
    tx.outputs[0].value = funding.value - fee;
    Ok((tx, fee))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::OutPoint;
    use tidemark_proofs::digest::sha256;

    #[test]
    fn anchor_tx_pays_exactly_the_fee() {
        let funding = Unspent {
            outpoint: OutPoint {
                txid: sha256(b"utxo"),
                vout: 0,
            },
            value: 100_000,
        };
        let top = sha256(b"top");
        let (tx, fee) = build_anchor_tx(&funding, &[0x00, 0x14, 0xaa], &top, 2).unwrap();

        assert_eq!(tx.total_output_value() + fee, funding.value);
        assert_eq!(tx.commitment_payload(), Some(top));
        assert_eq!(tx.inputs[0].sequence, RBF_SEQUENCE);
        assert!(fee >= 2 * tx.vsize());
    }

    #[test]
    fn anchor_tx_rejects_underfunded_input() {
        let funding = Unspent {
            outpoint: OutPoint {
                txid: sha256(b"dust"),
                vout: 0,
            },
            value: 600,
        };
        assert!(matches!(
            build_anchor_tx(&funding, &[0x00], &sha256(b"t"), 5),
            Err(StamperError::NoSpendableOutput)
        ));
    }
}
