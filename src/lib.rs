//! Whatsmeow-bot: a WhatsApp reply bot and a generative-text client.
//!
//! The WhatsApp side is a small Rust implementation of the WhatsApp Web
//! protocol in the spirit of the [whatsmeow](https://github.com/tulir/whatsmeow)
//! Go library, with a bot on top that reacts to incoming messages.
//!
//! ## Modules
//!
//! - `types` - Core types like JID, MessageID, and events
//! - `binary` - Binary XML encoding/decoding
//! - `crypto` - Noise, key pairs and media encryption
//! - `socket` - Framed websocket transport and handshake
//! - `store` - Device persistence (memory and SQLite)
//! - `protocol` - High-level client API
//! - `bot` - Event handler and responders
//! - `genai` - Gemini `generateContent` client

pub mod binary;
pub mod bot;
pub mod config;
pub mod crypto;
pub mod genai;
pub mod logging;
pub mod proto;
pub mod protocol;
pub mod socket;
pub mod store;
pub mod types;

pub use bot::{Bot, BotClient, BotError};
pub use config::{BotConfig, ConfigError};
pub use protocol::{Client, ClientConfig, ClientError};
pub use types::{Event, MessageID, JID};
