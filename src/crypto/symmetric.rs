//! AES-256-GCM encryption for private-key custody and legacy server-aided DMs
//! (spec §4.1, §4.10).

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::NodeError;

pub const NONCE_LEN: usize = 12;

/// Encrypts `plaintext` under `key` (32 bytes), returning `nonce || ciphertext`.
/// Grounded in the same nonce-prefixed-ciphertext wire shape used for
/// password-wrapped private keys throughout the teacher's key-custody code.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, NodeError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut aes_gcm::aead::OsRng);
    let mut ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| NodeError::Internal("AES-GCM encryption failed".into()))?;
    let mut out = nonce.to_vec();
    out.append(&mut ciphertext);
    Ok(out)
}

pub fn decrypt(key: &[u8; 32], nonce_and_ciphertext: &[u8]) -> Result<Vec<u8>, NodeError> {
    if nonce_and_ciphertext.len() < NONCE_LEN {
        return Err(NodeError::Validation("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = nonce_and_ciphertext.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| NodeError::Internal("AES-GCM decryption failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = [7u8; 32];
        let plaintext = b"the quick brown fox";
        let ciphertext = encrypt(&key, plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let ciphertext = encrypt(&[1u8; 32], b"secret").unwrap();
        assert!(decrypt(&[2u8; 32], &ciphertext).is_err());
    }
}
