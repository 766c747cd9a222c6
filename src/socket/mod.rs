//! WebSocket transport for WhatsApp protocol.
//!
//! Frames are length-prefixed with 3 big-endian bytes. The very first frame
//! of a connection also carries the `WA` header. After the Noise handshake
//! every frame payload is AES-GCM encrypted with per-direction counters.

pub mod handshake;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, trace};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::crypto::{Cipher, CipherError};

pub use handshake::{do_handshake, Dialer, HandshakeError, NoiseDialer};

/// WhatsApp WebSocket endpoints.
pub mod endpoints {
    pub const MAIN: &str = "wss://web.whatsapp.com/ws/chat";
    pub const ORIGIN: &str = "https://web.whatsapp.com";
}

/// Connection header: 'W', 'A', magic value 6, dictionary version 3.
pub const WA_HEADER: [u8; 4] = [b'W', b'A', 6, 3];

const FRAME_LENGTH_SIZE: usize = 3;
const FRAME_MAX_SIZE: usize = 1 << 24;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Prefix `payload` with its 3-byte length, and the header when given.
pub fn encode_frame(payload: &[u8], header: Option<&[u8]>) -> Result<Vec<u8>, SocketError> {
    if payload.len() >= FRAME_MAX_SIZE {
        return Err(SocketError::FrameTooLarge(payload.len()));
    }
    let header = header.unwrap_or_default();
    let mut frame = Vec::with_capacity(header.len() + FRAME_LENGTH_SIZE + payload.len());
    frame.extend_from_slice(header);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reassembles frames from websocket messages.
///
/// A message may hold several frames and a frame may span several messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete frame payload.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < FRAME_LENGTH_SIZE {
            return None;
        }
        let len = self.buf[..FRAME_LENGTH_SIZE]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        if self.buf.len() < FRAME_LENGTH_SIZE + len {
            return None;
        }
        let frame = self.buf[FRAME_LENGTH_SIZE..FRAME_LENGTH_SIZE + len].to_vec();
        self.buf.drain(..FRAME_LENGTH_SIZE + len);
        Some(frame)
    }
}

/// Open a websocket to `url` with the web client's `Origin` header.
pub async fn connect_ws(url: &str, origin: &str) -> Result<WsStream, SocketError> {
    let mut request = url.into_client_request()?;
    let origin = HeaderValue::from_str(origin)
        .map_err(|e| SocketError::ConnectionFailed(format!("bad origin: {e}")))?;
    request.headers_mut().insert("Origin", origin);

    debug!("Dialing {url}");
    let (ws, _response) = connect_async(request).await?;
    Ok(ws)
}

/// Unencrypted framed socket used during the handshake.
pub struct FrameSocket {
    ws: WsStream,
    buffer: FrameBuffer,
    header_sent: bool,
}

impl FrameSocket {
    pub fn new(ws: WsStream) -> Self {
        Self {
            ws,
            buffer: FrameBuffer::default(),
            header_sent: false,
        }
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), SocketError> {
        let header = (!self.header_sent).then_some(&WA_HEADER[..]);
        let frame = encode_frame(payload, header)?;
        self.header_sent = true;
        self.ws.send(Message::Binary(frame)).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, SocketError> {
        recv_frame(&mut self.ws, &mut self.buffer).await
    }

    /// Switch to transport mode with the keys from the handshake.
    pub fn into_noise_socket(self, write_key: &[u8; 32], read_key: &[u8; 32]) -> Result<NoiseSocket, SocketError> {
        let (sink, stream) = self.ws.split();
        Ok(NoiseSocket {
            writer: NoiseWriter {
                sink,
                cipher: Cipher::new(write_key)?,
            },
            reader: NoiseReader {
                stream,
                buffer: self.buffer,
                cipher: Cipher::new(read_key)?,
            },
        })
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

async fn recv_frame<S>(stream: &mut S, buffer: &mut FrameBuffer) -> Result<Vec<u8>, SocketError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        if let Some(frame) = buffer.next_frame() {
            return Ok(frame);
        }
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => buffer.push(&data),
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("{}: {}", f.code, f.reason))
                    .unwrap_or_default();
                return Err(SocketError::Closed(reason));
            }
            Some(Ok(other)) => trace!("Ignoring websocket message {other:?}"),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(SocketError::Closed("stream ended".to_string())),
        }
    }
}

/// Sending half of an established connection.
#[async_trait]
pub trait FrameWriter: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), SocketError>;
    async fn close(&mut self);
}

/// Receiving half of an established connection.
#[async_trait]
pub trait FrameReader: Send {
    async fn recv(&mut self) -> Result<Vec<u8>, SocketError>;
}

/// Both halves of an established connection.
pub struct Connection {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
}

/// Encrypted socket after a completed handshake.
pub struct NoiseSocket {
    writer: NoiseWriter,
    reader: NoiseReader,
}

impl NoiseSocket {
    /// Split into halves for a writer task and a read loop.
    pub fn split(self) -> (NoiseWriter, NoiseReader) {
        (self.writer, self.reader)
    }
}

pub struct NoiseWriter {
    sink: SplitSink<WsStream, Message>,
    cipher: Cipher,
}

#[async_trait]
impl FrameWriter for NoiseWriter {
    /// Encrypt and send one frame.
    async fn send(&mut self, plaintext: &[u8]) -> Result<(), SocketError> {
        let ciphertext = self.cipher.encrypt(plaintext, &[])?;
        let frame = encode_frame(&ciphertext, None)?;
        self.sink.send(Message::Binary(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

pub struct NoiseReader {
    stream: SplitStream<WsStream>,
    buffer: FrameBuffer,
    cipher: Cipher,
}

#[async_trait]
impl FrameReader for NoiseReader {
    /// Receive and decrypt one frame.
    async fn recv(&mut self) -> Result<Vec<u8>, SocketError> {
        let frame = recv_frame(&mut self.stream, &mut self.buffer).await?;
        Ok(self.cipher.decrypt(&frame, &[])?)
    }
}
