use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProofError {
    #[error("path has no operations")]
    EmptyPath,
    #[error("path does not end in an attestation")]
    MissingAttestation,
    #[error("attestation before the end of the path (position {0})")]
    MisplacedAttestation(usize),
    #[error("expected {expected} bytes, got {got}")]
    BadDigestLength { expected: usize, got: usize },
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ProofError>;
