//! Media encryption as used for WhatsApp attachments.
//!
//! A random 32-byte media key is expanded with HKDF into an IV, an AES
//! key, a MAC key and a ref key. The blob on the media servers is
//! `AES-256-CBC(plaintext) || HMAC-SHA256(iv || ciphertext)[..10]`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::hkdf::{hmac_sha256, Hkdf};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const MAC_LENGTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaType {
    /// HKDF info string for key expansion.
    pub fn hkdf_info(self) -> &'static [u8] {
        match self {
            MediaType::Image => b"WhatsApp Image Keys",
            MediaType::Video => b"WhatsApp Video Keys",
            MediaType::Audio => b"WhatsApp Audio Keys",
            MediaType::Document => b"WhatsApp Document Keys",
        }
    }

    /// Path segment under `/mms/` on the media hosts.
    pub fn mms_type(self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media key must be 32 bytes, got {0}")]
    InvalidMediaKey(usize),
    #[error("encrypted media is too short ({0} bytes)")]
    TooShort(usize),
    #[error("encrypted file hash mismatch")]
    EncHashMismatch,
    #[error("media MAC mismatch")]
    MacMismatch,
    #[error("invalid padding in decrypted media")]
    BadPadding,
    #[error("decrypted file hash mismatch")]
    HashMismatch,
}

/// Keys expanded from a media key.
#[derive(Clone)]
pub struct MediaKeys {
    pub iv: [u8; 16],
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub ref_key: [u8; 32],
}

impl MediaKeys {
    pub fn derive(media_key: &[u8], media_type: MediaType) -> Result<Self, MediaError> {
        let key: &[u8; 32] = media_key
            .try_into()
            .map_err(|_| MediaError::InvalidMediaKey(media_key.len()))?;
        Ok(Self::expand(key, media_type))
    }

    fn expand(media_key: &[u8; 32], media_type: MediaType) -> Self {
        let expanded = Hkdf::derive(None, media_key, media_type.hkdf_info(), 112);

        let mut keys = MediaKeys {
            iv: [0; 16],
            cipher_key: [0; 32],
            mac_key: [0; 32],
            ref_key: [0; 32],
        };
        keys.iv.copy_from_slice(&expanded[..16]);
        keys.cipher_key.copy_from_slice(&expanded[16..48]);
        keys.mac_key.copy_from_slice(&expanded[48..80]);
        keys.ref_key.copy_from_slice(&expanded[80..112]);
        keys
    }
}

/// Result of encrypting a file for upload.
#[derive(Debug, Clone)]
pub struct EncryptedMedia {
    pub media_key: [u8; 32],
    /// Ciphertext with the truncated MAC appended.
    pub data: Vec<u8>,
    pub file_sha256: [u8; 32],
    pub file_enc_sha256: [u8; 32],
    pub file_length: u64,
}

pub fn encrypt_media(plaintext: &[u8], media_type: MediaType) -> EncryptedMedia {
    let mut media_key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut media_key);
    encrypt_with_key(plaintext, media_key, media_type)
}

fn encrypt_with_key(plaintext: &[u8], media_key: [u8; 32], media_type: MediaType) -> EncryptedMedia {
    let keys = MediaKeys::expand(&media_key, media_type);

    let mut data = Aes256CbcEnc::new(&keys.cipher_key.into(), &keys.iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mac = hmac_sha256(&keys.mac_key, &[&keys.iv[..], &data[..]]);
    data.extend_from_slice(&mac[..MAC_LENGTH]);

    EncryptedMedia {
        media_key,
        file_sha256: Sha256::digest(plaintext).into(),
        file_enc_sha256: Sha256::digest(&data).into(),
        file_length: plaintext.len() as u64,
        data,
    }
}

/// Verify and decrypt a downloaded media blob.
///
/// Hash checks are skipped when the message did not carry the hash.
pub fn decrypt_media(
    data: &[u8],
    media_key: &[u8],
    media_type: MediaType,
    file_enc_sha256: Option<&[u8]>,
    file_sha256: Option<&[u8]>,
) -> Result<Vec<u8>, MediaError> {
    if data.len() <= MAC_LENGTH {
        return Err(MediaError::TooShort(data.len()));
    }
    let keys = MediaKeys::derive(media_key, media_type)?;

    if let Some(expected) = file_enc_sha256 {
        if Sha256::digest(data).as_slice() != expected {
            return Err(MediaError::EncHashMismatch);
        }
    }

    let (ciphertext, mac) = data.split_at(data.len() - MAC_LENGTH);
    let mut verifier =
        Hmac::<Sha256>::new_from_slice(&keys.mac_key).map_err(|_| MediaError::MacMismatch)?;
    verifier.update(&keys.iv);
    verifier.update(ciphertext);
    verifier
        .verify_truncated_left(mac)
        .map_err(|_| MediaError::MacMismatch)?;

    let plaintext = Aes256CbcDec::new(&keys.cipher_key.into(), &keys.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| MediaError::BadPadding)?;

    if let Some(expected) = file_sha256 {
        if Sha256::digest(&plaintext).as_slice() != expected {
            return Err(MediaError::HashMismatch);
        }
    }

    Ok(plaintext)
}
