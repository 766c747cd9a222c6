//! AES-256-GCM cipher for Noise transport frames.
//!
//! The IV is twelve bytes with a big-endian 32-bit counter in the last
//! four. Each direction keeps its own counter.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CipherError {
    #[error("invalid key")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Counter-nonce AES-256-GCM cipher.
pub struct Cipher {
    aead: Aes256Gcm,
    counter: u32,
}

/// Build the counter IV used by both handshake and transport encryption.
pub(crate) fn counter_iv(counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

impl Cipher {
    pub fn new(key: &[u8; 32]) -> Result<Self, CipherError> {
        let aead = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self { aead, counter: 0 })
    }

    /// Encrypt with the next nonce.
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let iv = counter_iv(self.counter);
        let out = self
            .aead
            .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad: ad })
            .map_err(|_| CipherError::EncryptionFailed)?;
        self.counter = self.counter.wrapping_add(1);
        Ok(out)
    }

    /// Decrypt with the next nonce. The counter only advances on success.
    pub fn decrypt(&mut self, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let iv = counter_iv(self.counter);
        let out = self
            .aead
            .decrypt(Nonce::from_slice(&iv), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CipherError::DecryptionFailed)?;
        self.counter = self.counter.wrapping_add(1);
        Ok(out)
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}
