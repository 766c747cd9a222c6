//! Core types used across the client: JIDs and events.

mod events;
mod jid;

pub use events::*;
pub use jid::*;
