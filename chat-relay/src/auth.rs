//! Credential derivation and challenge-response proofs.
//!
//! The relay never sees a password. Clients derive a password hash locally
//! and prove knowledge of it by MACing a one-time server nonce with it.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Sha256, Sha512};

const PBKDF2_ROUNDS: u32 = 10_000;
const NONCE_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Derives the stored password hash for `login`.
///
/// PBKDF2-HMAC-SHA512 salted with the lower-cased login, hex encoded.
pub fn password_hash(login: &str, password: &str) -> String {
    let salt = login.to_lowercase();
    let mut derived = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha512>(
        password.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ROUNDS,
        &mut derived,
    );
    hex::encode(derived)
}

/// Fresh hex-encoded nonce from the OS random source.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn keyed_mac(password_hash: &str, nonce: &str) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(password_hash.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(nonce.as_bytes());
    mac
}

/// Raw challenge digest: HMAC-SHA256 over the nonce, keyed with the hash.
pub fn challenge_digest(password_hash: &str, nonce: &str) -> Vec<u8> {
    keyed_mac(password_hash, nonce)
        .finalize()
        .into_bytes()
        .to_vec()
}

/// Digest as it travels in the client's `{response: 511, data}` reply.
pub fn encoded_challenge_response(password_hash: &str, nonce: &str) -> String {
    STANDARD.encode(challenge_digest(password_hash, nonce))
}

/// Constant-time check of a client-supplied digest.
pub fn verify_challenge(password_hash: &str, nonce: &str, digest: &[u8]) -> bool {
    keyed_mac(password_hash, nonce).verify_slice(digest).is_ok()
}

/// Decodes the base64 `data` field of a challenge reply.
pub fn decode_challenge_response(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data.trim()).ok()
}
