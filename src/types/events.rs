//! Event types for WhatsApp events.
//!
//! These events are emitted when various things happen on the WhatsApp connection.

use chrono::{DateTime, Utc};

use crate::binary::Node;
use crate::proto;
use crate::types::{MessageID, JID};

/// Connected is emitted once the server accepted the login.
#[derive(Debug, Clone, Default)]
pub struct Connected;

/// Disconnected event is emitted when the client disconnects.
#[derive(Debug, Clone)]
pub struct Disconnected {
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    /// The websocket closed or failed to read
    ConnectionLost(String),
    /// The server sent a `failure` stanza other than logout
    ServerFailure(String),
    /// Pairing QR codes ran out
    PairingTimeout,
}

/// LoggedOut event is emitted when the server rejects the session.
#[derive(Debug, Clone)]
pub struct LoggedOut {
    /// Whether the logout arrived as the answer to a login attempt
    pub on_connect: bool,
    pub reason: String,
}

/// StreamError is emitted for `stream:error` codes the client does not handle.
#[derive(Debug, Clone)]
pub struct StreamError {
    pub code: String,
    pub raw: Node,
}

/// PairSuccess is emitted after a QR scan linked this device.
#[derive(Debug, Clone)]
pub struct PairSuccess {
    pub id: JID,
    pub business_name: String,
    pub platform: String,
}

/// Metadata of a received message.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub id: MessageID,
    /// Chat JID (same as sender for 1:1, group JID for groups)
    pub chat: JID,
    pub sender: JID,
    pub is_from_me: bool,
    pub is_group: bool,
    pub timestamp: DateTime<Utc>,
    pub push_name: String,
    /// `type` attribute of the stanza, e.g. `text` or `media`
    pub msg_type: String,
}

/// Message event containing a received message.
#[derive(Debug, Clone)]
pub struct Message {
    pub info: MessageInfo,
    pub message: proto::Message,
}

/// A message whose payload could not be read.
#[derive(Debug, Clone)]
pub struct UndecryptableMessage {
    pub info: MessageInfo,
}

/// Receipt event for message delivery/read status.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub message_ids: Vec<MessageID>,
    pub chat: JID,
    pub sender: JID,
    pub receipt_type: ReceiptType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptType {
    Delivered,
    Read,
    Played,
    Sender,
    Retry,
    Other(String),
}

impl ReceiptType {
    /// Maps the `type` attribute of a receipt stanza. A missing type means delivered.
    pub fn from_attr(value: Option<&str>) -> Self {
        match value {
            None | Some("") => ReceiptType::Delivered,
            Some("read") => ReceiptType::Read,
            Some("played") => ReceiptType::Played,
            Some("sender") => ReceiptType::Sender,
            Some("retry") => ReceiptType::Retry,
            Some(other) => ReceiptType::Other(other.to_string()),
        }
    }
}

/// All events a client hands to its event handlers.
#[derive(Debug, Clone)]
pub enum Event {
    Connected(Connected),
    Disconnected(Disconnected),
    LoggedOut(LoggedOut),
    StreamError(StreamError),
    PairSuccess(PairSuccess),
    Message(Box<Message>),
    UndecryptableMessage(UndecryptableMessage),
    Receipt(Receipt),
}

impl Event {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected(_) => "Connected",
            Event::Disconnected(_) => "Disconnected",
            Event::LoggedOut(_) => "LoggedOut",
            Event::StreamError(_) => "StreamError",
            Event::PairSuccess(_) => "PairSuccess",
            Event::Message(_) => "Message",
            Event::UndecryptableMessage(_) => "UndecryptableMessage",
            Event::Receipt(_) => "Receipt",
        }
    }
}

/// Converts a unix timestamp attribute, falling back to the epoch.
pub fn unix_time(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
