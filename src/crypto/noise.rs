//! Noise_XX_25519_AESGCM_SHA256 handshake state.
//!
//! Mirrors the symmetric state used by WhatsApp Web: a running hash, a
//! salt (chaining key) and a current AES-GCM key with its own counter.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::cipher::counter_iv;
use super::hkdf::Hkdf;

/// Pattern name, exactly 32 bytes so it seeds the hash directly.
pub const NOISE_PATTERN: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NoiseError {
    #[error("invalid key")]
    InvalidKey,
    #[error("handshake encryption failed")]
    EncryptionFailed,
    #[error("handshake decryption failed")]
    DecryptionFailed,
}

pub struct NoiseHandshake {
    hash: [u8; 32],
    salt: [u8; 32],
    key: [u8; 32],
    counter: u32,
}

impl NoiseHandshake {
    /// Start the handshake and authenticate the connection header as prologue.
    pub fn new(header: &[u8]) -> Self {
        let mut state = Self {
            hash: *NOISE_PATTERN,
            salt: *NOISE_PATTERN,
            key: *NOISE_PATTERN,
            counter: 0,
        };
        state.authenticate(header);
        state
    }

    /// Mix data into the running hash.
    pub fn authenticate(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    fn aead(&self) -> Result<Aes256Gcm, NoiseError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| NoiseError::InvalidKey)
    }

    /// Encrypt with the hash as associated data, then authenticate the ciphertext.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let iv = counter_iv(self.counter);
        let ciphertext = self
            .aead()?
            .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad: &self.hash })
            .map_err(|_| NoiseError::EncryptionFailed)?;
        self.counter += 1;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let iv = counter_iv(self.counter);
        let plaintext = self
            .aead()?
            .decrypt(Nonce::from_slice(&iv), Payload { msg: ciphertext, aad: &self.hash })
            .map_err(|_| NoiseError::DecryptionFailed)?;
        self.counter += 1;
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    /// Mix a DH output into the salt and key, resetting the counter.
    pub fn mix_into_key(&mut self, shared_secret: &[u8]) {
        let derived = Hkdf::derive(Some(&self.salt), shared_secret, b"", 64);
        self.salt.copy_from_slice(&derived[..32]);
        self.key.copy_from_slice(&derived[32..]);
        self.counter = 0;
    }

    /// X25519 with a raw private scalar, then `mix_into_key`.
    pub fn mix_shared_secret(&mut self, private: &[u8; 32], public: &[u8; 32]) {
        let shared = x25519_dalek::x25519(*private, *public);
        self.mix_into_key(&shared);
    }

    /// Split into `(write_key, read_key)` for the transport phase.
    pub fn finish(&self) -> ([u8; 32], [u8; 32]) {
        let derived = Hkdf::derive(Some(&self.salt), &[], b"", 64);
        let mut write_key = [0u8; 32];
        let mut read_key = [0u8; 32];
        write_key.copy_from_slice(&derived[..32]);
        read_key.copy_from_slice(&derived[32..]);
        (write_key, read_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn both_sides_derive_the_same_transport_keys() {
        let header = [b'W', b'A', 6, 3];
        let mut client = NoiseHandshake::new(&header);
        let mut server = NoiseHandshake::new(&header);

        let client_eph = KeyPair::generate();
        let server_eph = KeyPair::generate();
        client.authenticate(&client_eph.public);
        server.authenticate(&client_eph.public);
        client.authenticate(&server_eph.public);
        server.authenticate(&server_eph.public);

        client.mix_shared_secret(&client_eph.private, &server_eph.public);
        server.mix_shared_secret(&server_eph.private, &client_eph.public);

        let sealed = server.encrypt(b"server static").unwrap();
        assert_eq!(client.decrypt(&sealed).unwrap(), b"server static");

        assert_eq!(client.finish(), server.finish());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let mut a = NoiseHandshake::new(b"prologue");
        let mut b = NoiseHandshake::new(b"prologue");
        a.mix_into_key(&[7; 32]);
        b.mix_into_key(&[7; 32]);

        let mut sealed = a.encrypt(b"payload").unwrap();
        sealed[0] ^= 0xff;
        assert_eq!(b.decrypt(&sealed), Err(NoiseError::DecryptionFailed));
    }
}
