use thiserror::Error;
use tidemark_proofs::{Digest, ProofError};

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch in journal record at offset {offset}")]
    ChecksumMismatch { offset: u64 },
    #[error("offset {offset} is not a journal record boundary")]
    BadRecordBoundary { offset: u64 },
    #[error("index entry for {digest} points at offset {offset}, past journal end {journal_len}")]
    IndexBeyondJournal {
        digest: Digest,
        offset: u64,
        journal_len: u64,
    },
    #[error("record decode error at offset {offset}: {message}")]
    Decode { offset: u64, message: String },
    #[error("indexed digest {digest} not reachable from record at offset {offset}")]
    Unreachable { digest: Digest, offset: u64 },
    #[error("unknown commitment {0}")]
    UnknownCommitment(Digest),
    #[error("conflicting upgrade for commitment {0}")]
    ConflictingUpgrade(Digest),
    #[error("commitment path must end in a pending attestation")]
    ExpectedPending,
    #[error("upgrade path must end in a bitcoin attestation")]
    ExpectedBitcoin,
    #[error("proof error: {0}")]
    Proof(#[from] ProofError),
}

impl CalendarError {
    /// Errors that mean the on-disk state contradicts itself. The server
    /// aborts on these rather than serving bad proofs.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            CalendarError::ChecksumMismatch { .. }
                | CalendarError::IndexBeyondJournal { .. }
                | CalendarError::Unreachable { .. }
                | CalendarError::ConflictingUpgrade(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CalendarError>;
