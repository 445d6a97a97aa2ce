/// PKCE (RFC 7636) primitives: code verifier, S256 challenge, CSRF state
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Generate PKCE code verifier (43-128 characters per RFC 7636).
/// 48 random bytes encode to 64 base64url characters.
pub fn generate_code_verifier() -> String {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    let mut random_bytes = vec![0u8; 48];
    rng.fill_bytes(&mut random_bytes);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generate PKCE code challenge: base64url(SHA-256(verifier)), no padding.
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let hash = hasher.finalize();
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate random state for CSRF protection.
pub fn generate_state() -> String {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    let mut random_bytes = vec![0u8; 16];
    rng.fill_bytes(&mut random_bytes);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Transient state for one authorization attempt. Created at flow start,
/// consumed exactly once on callback, never reused.
#[derive(Debug, Clone)]
pub struct PkceSession {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
    pub issued_at: DateTime<Utc>,
}

impl PkceSession {
    pub fn generate() -> Self {
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        Self {
            verifier,
            challenge,
            state: generate_state(),
            issued_at: Utc::now(),
        }
    }
}
