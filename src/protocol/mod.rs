//! Protocol module for high-level WhatsApp operations.
//!
//! Contains the main Client implementation and protocol logic.

mod client;
mod media;
mod message;
mod qr;
mod request;

pub use client::{Client, ClientConfig, ClientError, EventHandler, SendResponse};
pub use media::{MediaConn, MediaDownload, TransferError, UploadResponse};
pub use message::{build_ack, build_message_node, build_receipt, parse_message, parse_receipt, StanzaError};
pub use qr::{render_qr_ascii, PairSuccessInfo, QRChannel, QREvent, QRError, QRPairing};
pub use request::{generate_message_id, RequestTracker};
