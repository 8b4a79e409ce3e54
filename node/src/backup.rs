//! Backup feed access tokens.
//!
//! The feed hands out raw journal bytes, so it is gated behind a token
//! derived from the calendar's secret `hmac-key`: the hex of the first 16
//! bytes of HMAC-SHA256 over a fixed label. Whoever holds the shared key
//! derives the same token out-of-band.

use hmac::{Hmac, Mac};
use sha2::{Digest as _, Sha256};

const TOKEN_LABEL: &[u8] = b"backup";
const TOKEN_BYTES: usize = 16;

type HmacSha256 = Hmac<Sha256>;

pub fn derive_backup_token(hmac_key: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(TOKEN_LABEL);
    let tag = mac.finalize().into_bytes();
    hex::encode(&tag[..TOKEN_BYTES])
}

/// Timing-safe comparison: both sides are hashed before the equality
/// check, so the comparison leaks nothing about the expected token.
pub fn verify_backup_token(hmac_key: &[u8], presented: &str) -> bool {
    let expected = derive_backup_token(hmac_key);
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_stable_per_key() {
        let key = [7u8; 32];
        assert_eq!(derive_backup_token(&key), derive_backup_token(&key));
        assert_eq!(derive_backup_token(&key).len(), TOKEN_BYTES * 2);
    }

    #[test]
    fn different_keys_different_tokens() {
        assert_ne!(derive_backup_token(&[1u8; 32]), derive_backup_token(&[2u8; 32]));
    }

    #[test]
    fn verification_accepts_only_the_real_token() {
        let key = [9u8; 32];
        let token = derive_backup_token(&key);
        assert!(verify_backup_token(&key, &token));
        assert!(!verify_backup_token(&key, "deadbeef"));
        assert!(!verify_backup_token(&key, ""));
        assert!(!verify_backup_token(&[8u8; 32], &token));
    }
}
