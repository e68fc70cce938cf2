//! Password hashing and bearer-session helpers.

use hex::encode;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Identity resolved from a bearer token: the user, plus the project the
/// session is scoped to (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub project_id: Option<String>,
}

pub fn str_to_hex_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    encode(hasher.finalize())
}

/// 32 random bytes, hex-encoded. Opaque to clients; validity lives in the
/// session table.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    encode(bytes)
}
