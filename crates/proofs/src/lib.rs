pub mod digest;
pub mod error;
pub mod merkle;
pub mod op;
pub mod path;

pub use digest::Digest;
pub use error::ProofError;
pub use op::{Attestation, Op};
pub use path::Path;
