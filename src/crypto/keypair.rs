//! Curve25519 key pairs for device identity and the Noise handshake.

use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// A Curve25519 key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public: [u8; 32],
    pub private: [u8; 32],
}

impl KeyPair {
    /// Generate a new random, clamped key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);

        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        Self::from_private_key(private)
    }

    /// Rebuild a key pair from a stored private key.
    pub fn from_private_key(private: [u8; 32]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(private));
        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// X25519 Diffie-Hellman with a peer public key.
    pub fn dh(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        *secret
            .diffie_hellman(&PublicKey::from(*their_public))
            .as_bytes()
    }

    /// Sign another key's DJB-prefixed public key.
    ///
    /// Uses the private scalar as an Ed25519 seed rather than XEdDSA.
    pub fn sign(&self, key_to_sign: &KeyPair) -> [u8; 64] {
        use ed25519_dalek::{Signer, SigningKey};

        let mut message = [0u8; 33];
        message[0] = 0x05;
        message[1..].copy_from_slice(&key_to_sign.public);

        SigningKey::from_bytes(&self.private).sign(&message).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// A signed pre-key advertised during registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
    pub signature: Option<[u8; 64]>,
}

impl PreKey {
    pub fn new(key_id: u32) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            key_id,
            signature: None,
        }
    }

    pub fn new_signed(key_id: u32, identity_key: &KeyPair) -> Self {
        let mut pre_key = Self::new(key_id);
        pre_key.signature = Some(identity_key.sign(&pre_key.key_pair));
        pre_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        assert_eq!(alice.dh(&bob.public), bob.dh(&alice.public));
    }

    #[test]
    fn rebuilding_from_private_key_gives_same_public() {
        let original = KeyPair::generate();
        let rebuilt = KeyPair::from_private_key(original.private);
        assert_eq!(original, rebuilt);
    }

    #[test]
    fn debug_output_hides_private_key() {
        let kp = KeyPair::generate();
        let debug = format!("{kp:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode(kp.private)));
    }

    #[test]
    fn signed_pre_key_has_signature() {
        let identity = KeyPair::generate();
        let pk = PreKey::new_signed(1, &identity);
        assert_eq!(pk.key_id, 1);
        assert!(pk.signature.is_some());
    }
}
