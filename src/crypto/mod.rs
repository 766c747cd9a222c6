//! Cryptographic primitives for the WhatsApp Web protocol.
//!
//! - Curve25519 key pairs and signed pre-keys for device identity
//! - HKDF-SHA256 key derivation
//! - AES-256-GCM transport cipher and the Noise XX handshake state
//! - AES-256-CBC + HMAC media encryption

mod cipher;
mod hkdf;
mod keypair;
mod media;
mod noise;

pub use cipher::{Cipher, CipherError};
pub use hkdf::{hmac_sha256, Hkdf};
pub use keypair::{KeyPair, PreKey};
pub use media::{decrypt_media, encrypt_media, EncryptedMedia, MediaError, MediaKeys, MediaType};
pub use noise::{NoiseHandshake, NoiseError, NOISE_PATTERN};
