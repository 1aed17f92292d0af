use argon2::Argon2;
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const API_KEY_PREFIX: &str = "eng_sk_";
pub const ACCESS_TOKEN_PREFIX: &str = "eng_at_";

/// Generate an API key. Returns `(full_key, sha256_hash)`.
/// Key format: `eng_sk_` + 32 random bytes hex-encoded.
pub fn generate_api_key() -> (String, String) {
    let raw = random_hex(32);
    let full_key = format!("{API_KEY_PREFIX}{raw}");
    let hash = hash_token(&full_key);
    (full_key, hash)
}

/// Generate a login access token. Returns `(full_token, sha256_hash)`.
/// Format: `eng_at_` + 32 random bytes hex-encoded.
pub fn generate_access_token() -> (String, String) {
    let raw = random_hex(32);
    let full_token = format!("{ACCESS_TOKEN_PREFIX}{raw}");
    let hash = hash_token(&full_token);
    (full_token, hash)
}

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the first 8 chars after `eng_sk_` for display/identification.
pub fn key_prefix(full_key: &str) -> String {
    full_key
        .strip_prefix(API_KEY_PREFIX)
        .map(|rest| rest.chars().take(8).collect())
        .unwrap_or_default()
}

/// Hash a password with Argon2id and a random salt.
pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| format!("Failed to hash password: {e}"))
}

/// Verify a password against an Argon2id hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed = PasswordHash::new(hash).map_err(|e| format!("Invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Generate `n` random bytes and return as hex string.
fn random_hex(n: usize) -> String {
    let bytes: Vec<u8> = (0..n).map(|_| rand::thread_rng().r#gen::<u8>()).collect();
    hex::encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_has_prefix_and_matching_hash() {
        let (key, hash) = generate_api_key();
        assert!(key.starts_with("eng_sk_"));
        assert_eq!(hash, hash_token(&key));
        assert_eq!(key_prefix(&key).len(), 8);
    }

    #[test]
    fn access_token_has_prefix_and_matching_hash() {
        let (token, hash) = generate_access_token();
        assert!(token.starts_with("eng_at_"));
        assert_eq!(hash, hash_token(&token));
        assert_eq!(key_prefix(&token), "");
    }

    #[test]
    fn tokens_are_unique() {
        let (a, _) = generate_access_token();
        let (b, _) = generate_access_token();
        assert_ne!(a, b);
    }

    #[test]
    fn password_verifies_only_with_original() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn malformed_password_hash_is_an_error() {
        assert!(verify_password("anything", "not-a-phc-string").is_err());
    }
}
