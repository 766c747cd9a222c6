//! Device identity, keys and pairing result.

use crate::crypto::{KeyPair, PreKey};
use crate::types::JID;

/// Device represents one linked WhatsApp Web session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Noise Protocol static key pair
    pub noise_key: KeyPair,
    /// Signal identity key pair
    pub identity_key: KeyPair,
    pub signed_pre_key: PreKey,
    /// 14-bit registration ID
    pub registration_id: u32,
    /// Secret shared with the phone through the QR code
    pub adv_secret_key: [u8; 32],
    /// Device JID, set once pairing succeeded
    pub id: Option<JID>,
    pub platform: String,
    pub business_name: String,
    pub push_name: Option<String>,
}

impl Device {
    /// Create a fresh, unpaired device.
    pub fn generate() -> Self {
        let identity_key = KeyPair::generate();
        let signed_pre_key = PreKey::new_signed(1, &identity_key);
        Self {
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key,
            registration_id: rand::random::<u32>() & 0x3FFF,
            adv_secret_key: rand::random(),
            id: None,
            platform: String::new(),
            business_name: String::new(),
            push_name: None,
        }
    }

    /// Check if device is paired (has a JID).
    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }
}
