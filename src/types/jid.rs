//! WhatsApp JIDs (Jabber IDs).
//!
//! A JID names a user, a group, a broadcast list or one device of a user.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Known JID servers on WhatsApp
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const LEGACY_USER: &str = "c.us";
    pub const BROADCAST: &str = "broadcast";
    pub const HIDDEN_USER: &str = "lid";
}

/// User part of the status broadcast chat.
pub const STATUS_USER: &str = "status";

/// MessageID is the internal ID of a WhatsApp message.
pub type MessageID = String;

/// JID represents a WhatsApp user ID.
///
/// Regular JIDs are a user/server pair. AD-JIDs additionally carry an
/// agent and a device number and address one linked device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JID {
    pub user: String,
    pub raw_agent: u8,
    pub device: u16,
    pub server: String,
}

impl JID {
    /// Creates a new regular JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Creates an AD-JID as it appears in the binary protocol.
    pub fn new_ad(user: impl Into<String>, agent: u8, device: u8) -> Self {
        let (server, raw_agent) = match agent {
            1 => (servers::HIDDEN_USER, 0),
            _ => (servers::DEFAULT_USER, agent),
        };
        Self {
            user: user.into(),
            raw_agent,
            device: device as u16,
            server: server.to_string(),
        }
    }

    /// Returns the user part as an integer, zero when it is not numeric.
    pub fn user_int(&self) -> u64 {
        self.user.parse().unwrap_or(0)
    }

    /// Returns a version of the JID without agent and device.
    pub fn to_non_ad(&self) -> Self {
        Self::new(self.user.clone(), self.server.clone())
    }

    /// True for the `status@broadcast` chat used by status updates.
    pub fn is_status_broadcast(&self) -> bool {
        self.user == STATUS_USER
    }

    /// True for group chats.
    pub fn is_group(&self) -> bool {
        self.server == servers::GROUP
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw_agent > 0 {
            write!(f, "{}.{}:{}@{}", self.user, self.raw_agent, self.device, self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("failed to parse JID: {0}")]
pub struct ParseJIDError(pub String);

impl FromStr for JID {
    type Err = ParseJIDError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((user_part, server)) = s.split_once('@') else {
            return Ok(JID::new("", s));
        };
        if server.contains('@') {
            return Err(ParseJIDError(format!("too many '@' in {s:?}")));
        }

        let mut jid = JID::new(user_part, server);

        if let Some((user, ad)) = user_part.split_once('.') {
            let (agent, device) = match ad.split_once(':') {
                Some((agent, device)) => (agent, Some(device)),
                None => (ad, None),
            };
            jid.user = user.to_string();
            jid.raw_agent = agent
                .parse()
                .map_err(|_| ParseJIDError(format!("bad agent in {s:?}")))?;
            if let Some(device) = device {
                jid.device = device
                    .parse()
                    .map_err(|_| ParseJIDError(format!("bad device in {s:?}")))?;
            }
        } else if let Some((user, device)) = user_part.split_once(':') {
            jid.user = user.to_string();
            jid.device = device
                .parse()
                .map_err(|_| ParseJIDError(format!("bad device in {s:?}")))?;
        }

        Ok(jid)
    }
}

lazy_static::lazy_static! {
    pub static ref SERVER_JID: JID = JID::new("", servers::DEFAULT_USER);
    pub static ref STATUS_BROADCAST_JID: JID = JID::new(STATUS_USER, servers::BROADCAST);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_user_jid() {
        let jid: JID = "1234567890@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.server, servers::DEFAULT_USER);
        assert_eq!(jid.device, 0);
        assert_eq!(jid.raw_agent, 0);
    }

    #[test]
    fn parses_device_and_ad_jids() {
        let jid: JID = "1234567890:2@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.device, 2);

        let jid: JID = "1234567890.0:1@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.device, 1);

        assert!("12.x:1@s.whatsapp.net".parse::<JID>().is_err());
    }

    #[test]
    fn server_only_jid_round_trips_through_display() {
        let jid: JID = "s.whatsapp.net".parse().unwrap();
        assert_eq!(jid, *SERVER_JID);
        assert_eq!(jid.to_string(), "s.whatsapp.net");
    }

    #[test]
    fn display_includes_device() {
        let jid = JID {
            user: "1234567890".to_string(),
            device: 2,
            server: servers::DEFAULT_USER.to_string(),
            ..Default::default()
        };
        assert_eq!(jid.to_string(), "1234567890:2@s.whatsapp.net");
        assert_eq!(jid.to_non_ad().to_string(), "1234567890@s.whatsapp.net");
    }

    #[test]
    fn recognises_status_broadcast_and_groups() {
        let status: JID = "status@broadcast".parse().unwrap();
        assert!(status.is_status_broadcast());
        assert_eq!(status, *STATUS_BROADCAST_JID);

        let group: JID = "123456789-1234567890@g.us".parse().unwrap();
        assert!(group.is_group());
        assert!(!group.is_status_broadcast());
    }
}
