// src/protocol/crypto.rs

//! AES-256-GCM sealing of wire messages.
//!
//! The key is the SHA-256 digest of a shared secret string. A fresh 12-byte
//! nonce is generated per message and prepended to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::{FormicaryError, Result};

pub const NONCE_LEN: usize = 12;

fn cipher(secret: &str) -> Aes256Gcm {
    let digest = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(digest.as_slice()))
}

pub fn seal(secret: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher(secret)
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| FormicaryError::Crypto(format!("failed to encrypt: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open(secret: &str, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() <= NONCE_LEN {
        return Err(FormicaryError::Crypto(format!(
            "sealed payload too short ({} bytes)",
            sealed.len()
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher(secret)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| FormicaryError::Crypto(format!("failed to decrypt: {e}")))
}
