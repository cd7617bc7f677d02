use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Random single-use secret, hex encoded. Only its hash is ever persisted.
pub fn generate_claim_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_claim_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// A SHA-256 hex digest as carried through checkout metadata.
pub fn is_token_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_distinct_from_token() {
        let token = generate_claim_token();
        assert_eq!(token.len(), 64);
        let hash = hash_claim_token(&token);
        assert_eq!(hash, hash_claim_token(&token));
        assert_ne!(hash, token);
        assert!(is_token_hash(&hash));
    }

    #[test]
    fn rejects_malformed_hashes() {
        assert!(!is_token_hash("abc"));
        assert!(!is_token_hash(&"z".repeat(64)));
    }
}
