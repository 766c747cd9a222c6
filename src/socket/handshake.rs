//! WhatsApp Noise handshake.
//!
//! Implements the Noise_XX_25519_AESGCM_SHA256 handshake for WhatsApp Web.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use prost::Message as ProstMessage;
use thiserror::Error;
use tokio::time::timeout;

use super::{connect_ws, Connection, FrameSocket, NoiseSocket, SocketError, WA_HEADER};
use crate::crypto::{KeyPair, NoiseError, NoiseHandshake};
use crate::proto::{
    make_device_pairing_data, make_login_payload, make_registration_payload, ClientFinish,
    ClientHello, ClientPayload, HandshakeMessage,
};
use crate::store::Device;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("handshake timed out")]
    Timeout,
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error("invalid handshake message: {0}")]
    InvalidResponse(String),
    #[error("failed to decode handshake message: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Client payload for `device`: login when it has a JID, registration otherwise.
pub fn client_payload(device: &Device) -> ClientPayload {
    match &device.id {
        Some(jid) => make_login_payload(device.push_name.as_deref(), jid),
        None => make_registration_payload(
            device.push_name.as_deref(),
            make_device_pairing_data(
                device.registration_id,
                &device.identity_key.public,
                device.signed_pre_key.key_id,
                &device.signed_pre_key.key_pair.public,
                &device.signed_pre_key.signature.unwrap_or([0u8; 64]),
            ),
        ),
    }
}

fn to_key(bytes: &[u8], what: &str) -> Result<[u8; 32], HandshakeError> {
    bytes.try_into().map_err(|_| {
        HandshakeError::InvalidResponse(format!("{what} is {} bytes, expected 32", bytes.len()))
    })
}

/// Dial `url` and run the handshake for `device`.
pub async fn do_handshake(
    url: &str,
    origin: &str,
    device: &Device,
    wait: Duration,
) -> Result<NoiseSocket, HandshakeError> {
    let ws = timeout(wait, connect_ws(url, origin))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    let mut socket = FrameSocket::new(ws);

    let ephemeral = KeyPair::generate();
    let mut noise = NoiseHandshake::new(&WA_HEADER);
    noise.authenticate(&ephemeral.public);

    // -> e
    let hello = HandshakeMessage {
        client_hello: Some(ClientHello {
            ephemeral: Some(ephemeral.public.to_vec()),
        }),
        ..Default::default()
    };
    socket.send_frame(&hello.encode_to_vec()).await?;

    // <- e, ee, s, es
    let response = timeout(wait, socket.recv_frame())
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    let server_hello = HandshakeMessage::decode(&response[..])?
        .server_hello
        .ok_or_else(|| HandshakeError::InvalidResponse("missing server hello".into()))?;

    let (server_ephemeral, static_ciphertext, cert_ciphertext) = match server_hello {
        crate::proto::ServerHello {
            ephemeral: Some(e),
            r#static: Some(s),
            payload: Some(p),
        } => (to_key(&e, "server ephemeral")?, s, p),
        _ => return Err(HandshakeError::InvalidResponse("incomplete server hello".into())),
    };

    noise.authenticate(&server_ephemeral);
    noise.mix_shared_secret(&ephemeral.private, &server_ephemeral);

    let server_static = to_key(&noise.decrypt(&static_ciphertext)?, "server static")?;
    noise.mix_shared_secret(&ephemeral.private, &server_static);

    // TODO: verify the certificate chain against the WhatsApp root key
    let cert = noise.decrypt(&cert_ciphertext)?;
    debug!("Server certificate is {} bytes", cert.len());

    // -> s, se
    let static_encrypted = noise.encrypt(&device.noise_key.public)?;
    noise.mix_shared_secret(&device.noise_key.private, &server_ephemeral);

    let payload = client_payload(device);
    let payload_encrypted = noise.encrypt(&payload.encode_to_vec())?;

    let finish = HandshakeMessage {
        client_finish: Some(ClientFinish {
            r#static: Some(static_encrypted),
            payload: Some(payload_encrypted),
        }),
        ..Default::default()
    };
    socket.send_frame(&finish.encode_to_vec()).await?;

    let (write_key, read_key) = noise.finish();
    debug!("Noise handshake complete");
    Ok(socket.into_noise_socket(&write_key, &read_key)?)
}

/// Opens connections for a device. The client redials through it after a drop.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, device: &Device) -> Result<Connection, HandshakeError>;
}

/// Websocket dialer that runs the Noise handshake.
#[derive(Debug, Clone)]
pub struct NoiseDialer {
    pub url: String,
    pub origin: String,
    pub timeout: Duration,
}

#[async_trait]
impl Dialer for NoiseDialer {
    async fn dial(&self, device: &Device) -> Result<Connection, HandshakeError> {
        let (writer, reader) = do_handshake(&self.url, &self.origin, device, self.timeout)
            .await?
            .split();
        Ok(Connection {
            writer: Box::new(writer),
            reader: Box::new(reader),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaired_device_sends_registration() {
        let device = Device::generate();
        let payload = client_payload(&device);

        let pairing = payload.device_pairing_data.unwrap();
        assert_eq!(pairing.e_ident.as_deref(), Some(&device.identity_key.public[..]));
        assert_eq!(pairing.e_skey_sig.map(|s| s.len()), Some(64));
        assert!(payload.username.is_none());
    }

    #[test]
    fn paired_device_sends_login() {
        let mut device = Device::generate();
        device.id = Some("15550001111:4@s.whatsapp.net".parse().unwrap());
        let payload = client_payload(&device);

        assert_eq!(payload.username, Some(15550001111));
        assert_eq!(payload.device, Some(4));
        assert!(payload.device_pairing_data.is_none());
    }

    #[test]
    fn short_server_keys_are_rejected() {
        assert!(matches!(
            to_key(&[0u8; 31], "server static"),
            Err(HandshakeError::InvalidResponse(_))
        ));
    }
}
