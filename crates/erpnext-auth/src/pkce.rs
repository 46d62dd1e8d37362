//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! A fresh verifier/challenge pair and CSRF `state` are generated for every
//! login attempt and held only in memory until the code exchange finishes.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::constants::VERIFIER_LEN;

/// Only challenge method this client supports.
pub const CHALLENGE_METHOD: &str = "S256";

/// Verifier and derived S256 challenge for one login attempt.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a new pair from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn method(&self) -> &'static str {
        CHALLENGE_METHOD
    }
}

/// Generate a 64-character verifier over `[A-Za-z0-9_-]`.
///
/// 48 random bytes encode to exactly 64 URL-safe base64 characters, so every
/// character is uniformly drawn from the 64-symbol alphabet.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_LEN * 3 / 4];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`, no padding.
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Random single-use CSRF `state` (128 bits, URL-safe).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
