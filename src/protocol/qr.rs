//! QR code pairing for WhatsApp authentication.
//!
//! The server sends a list of refs in `pair-device`. Each ref becomes one
//! QR code; the phone scans it and the server answers with `pair-success`.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use prost::Message as ProstMessage;
use qrcode::render::unicode;
use qrcode::QrCode;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::binary::Node;
use crate::proto::AdvSignedDeviceIdentityHmac;
use crate::store::Device;
use crate::types::JID;

/// How long the first code stays valid.
pub const FIRST_CODE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long every later code stays valid.
pub const NEXT_CODE_TIMEOUT: Duration = Duration::from_secs(20);

/// QR channel event types.
#[derive(Debug, Clone, PartialEq)]
pub enum QREvent {
    /// New QR code to display
    Code { code: String, timeout: Duration },
    Success,
    /// Every code expired without a scan
    Timeout,
    Error(String),
}

/// QR channel for receiving pairing events.
pub type QRChannel = mpsc::Receiver<QREvent>;

#[derive(Debug, Error)]
pub enum QRError {
    #[error("QR generation failed: {0}")]
    Render(#[from] qrcode::types::QrError),
    #[error("missing <{0}> in pair-success")]
    MissingNode(&'static str),
    #[error("failed to decode device identity: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("device identity HMAC mismatch")]
    HmacMismatch,
    #[error("invalid device JID in pair-success")]
    InvalidJid,
}

/// Codes built from the refs of a `pair-device` stanza.
#[derive(Debug, Clone)]
pub struct QRPairing {
    codes: Vec<String>,
}

impl QRPairing {
    /// Build one code per ref: `ref,noise pub,identity pub,adv secret`.
    pub fn from_refs(refs: &[String], device: &Device) -> Self {
        let noise_pub = STANDARD.encode(device.noise_key.public);
        let identity_pub = STANDARD.encode(device.identity_key.public);
        let adv_secret = STANDARD.encode(device.adv_secret_key);

        let codes = refs
            .iter()
            .map(|r| format!("{r},{noise_pub},{identity_pub},{adv_secret}"))
            .collect();
        Self { codes }
    }

    /// Refs are the byte contents of the `<ref>` children.
    pub fn refs_from_node(pair_device: &Node) -> Vec<String> {
        pair_device
            .get_children_by_tag("ref")
            .filter_map(Node::get_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    /// Codes with the time each stays valid.
    pub fn codes(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.codes.iter().enumerate().map(|(i, code)| {
            let timeout = if i == 0 { FIRST_CODE_TIMEOUT } else { NEXT_CODE_TIMEOUT };
            (code.as_str(), timeout)
        })
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Render QR code as half-block characters for terminal display.
pub fn render_qr_ascii(data: &str) -> Result<String, QRError> {
    let code = QrCode::new(data.as_bytes())?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// What a verified `pair-success` tells us about the new session.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSuccessInfo {
    pub jid: JID,
    pub business_name: String,
    pub platform: String,
}

/// Check the device identity HMAC of a `pair-success` node.
pub fn verify_pair_success(pair_success: &Node, adv_secret: &[u8; 32]) -> Result<PairSuccessInfo, QRError> {
    let identity_bytes = pair_success
        .get_child_by_tag("device-identity")
        .and_then(Node::get_bytes)
        .ok_or(QRError::MissingNode("device-identity"))?;
    let jid = pair_success
        .get_child_by_tag("device")
        .ok_or(QRError::MissingNode("device"))?
        .get_attr_jid("jid")
        .ok_or(QRError::InvalidJid)?;
    let business_name = pair_success
        .get_child_by_tag("biz")
        .and_then(|n| n.get_attr_str("name"))
        .unwrap_or_default()
        .to_string();
    let platform = pair_success
        .get_child_by_tag("platform")
        .and_then(|n| n.get_attr_str("name"))
        .unwrap_or_default()
        .to_string();

    let container = AdvSignedDeviceIdentityHmac::decode(identity_bytes)?;
    let details = container.details.unwrap_or_default();
    let expected = container.hmac.unwrap_or_default();

    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(adv_secret)
        .map_err(|_| QRError::HmacMismatch)?;
    mac.update(&details);
    mac.verify_slice(&expected).map_err(|_| QRError::HmacMismatch)?;

    Ok(PairSuccessInfo {
        jid,
        business_name,
        platform,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_success_node(details: &[u8], hmac: Vec<u8>) -> Node {
        let identity = AdvSignedDeviceIdentityHmac {
            details: Some(details.to_vec()),
            hmac: Some(hmac),
        };
        Node::new("pair-success").with_children(vec![
            Node::new("device-identity").with_bytes(identity.encode_to_vec()),
            Node::new("device").with_attr("jid", JID::new_ad("15550001111", 0, 5)),
            Node::new("platform").with_attr("name", "android"),
            Node::new("biz").with_attr("name", "Shop"),
        ])
    }

    #[test]
    fn codes_join_ref_and_keys() {
        let device = Device::generate();
        let pairing = QRPairing::from_refs(&["ref1".into(), "ref2".into()], &device);

        let codes: Vec<_> = pairing.codes().collect();
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].1, FIRST_CODE_TIMEOUT);
        assert_eq!(codes[1].1, NEXT_CODE_TIMEOUT);

        let parts: Vec<&str> = codes[0].0.split(',').collect();
        assert_eq!(parts[0], "ref1");
        assert_eq!(STANDARD.decode(parts[1]).unwrap(), device.noise_key.public);
        assert_eq!(STANDARD.decode(parts[3]).unwrap(), device.adv_secret_key);
    }

    #[test]
    fn refs_are_read_from_pair_device() {
        let node = Node::new("pair-device").with_children(vec![
            Node::new("ref").with_bytes(b"2@abc".to_vec()),
            Node::new("ref").with_bytes(b"2@def".to_vec()),
        ]);
        assert_eq!(QRPairing::refs_from_node(&node), vec!["2@abc", "2@def"]);
    }

    #[test]
    fn accepts_valid_hmac() {
        let secret = [9u8; 32];
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&secret).unwrap();
        mac.update(b"details");
        let node = pair_success_node(b"details", mac.finalize().into_bytes().to_vec());

        let info = verify_pair_success(&node, &secret).unwrap();
        assert_eq!(info.jid.to_string(), "15550001111:5@s.whatsapp.net");
        assert_eq!(info.platform, "android");
        assert_eq!(info.business_name, "Shop");
    }

    #[test]
    fn rejects_bad_hmac() {
        let node = pair_success_node(b"details", vec![0u8; 32]);
        assert!(matches!(
            verify_pair_success(&node, &[9u8; 32]),
            Err(QRError::HmacMismatch)
        ));
    }

    #[test]
    fn renders_terminal_qr() {
        let art = render_qr_ascii("2@abc,def").unwrap();
        assert!(art.lines().count() > 10);
    }
}
