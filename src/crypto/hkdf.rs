//! HKDF (HMAC-based Key Derivation Function, RFC 5869) over SHA-256.
//!
//! Used by the Noise handshake and by media key expansion.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// HKDF-SHA256 key derivation.
pub struct Hkdf {
    prk: [u8; 32],
}

impl Hkdf {
    /// HKDF-Extract. A missing salt is 32 zero bytes.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = salt.unwrap_or(&[0u8; 32]);
        Self {
            prk: hmac_sha256(salt, &[ikm]),
        }
    }

    /// HKDF-Expand to `length` bytes.
    pub fn expand(&self, info: &[u8], length: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(length);
        let mut block: Vec<u8> = Vec::new();
        let mut counter = 1u8;

        while output.len() < length {
            block = hmac_sha256(&self.prk, &[&block[..], info, &[counter][..]]).to_vec();
            let take = (length - output.len()).min(block.len());
            output.extend_from_slice(&block[..take]);
            counter = counter.wrapping_add(1);
        }

        output
    }

    /// Extract and expand in one call.
    pub fn derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
        Self::new(salt, ikm).expand(info, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5869 appendix A.1
    #[test]
    fn matches_rfc5869_test_case_1() {
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();

        let okm = Hkdf::derive(Some(&salt), &ikm, &info, 42);
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn output_length_is_exact() {
        assert_eq!(Hkdf::derive(None, b"input key material", b"info", 112).len(), 112);
        assert_eq!(Hkdf::derive(None, b"ikm", b"", 0).len(), 0);
    }
}
