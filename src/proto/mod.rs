//! Protocol buffer definitions used on the wire.
//!
//! `handshake` covers the Noise handshake and client payload, `message`
//! covers end-to-end message content and pairing identity blobs.

mod handshake;
mod message;

pub use handshake::*;
pub use message::*;
