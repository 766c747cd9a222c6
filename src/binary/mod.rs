//! Binary XML encoding and decoding for WhatsApp protocol.
//!
//! Every stanza exchanged after the Noise handshake is a [`Node`] encoded
//! in this format and prefixed with a flags byte.

mod decoder;
mod encoder;
mod node;
mod token;

pub use decoder::{unmarshal, DecodeError, Decoder};
pub use encoder::{marshal, Encoder};
pub use node::*;
pub use token::{get_token, get_token_index};
