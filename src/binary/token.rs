//! Token dictionary and wire markers of the binary XML format.
//!
//! Strings found in the dictionary are sent as a single byte instead of
//! their full text.

use std::collections::HashMap;

pub const LIST_EMPTY: u8 = 0;
pub const DICTIONARY_0: u8 = 236;
pub const DICTIONARY_3: u8 = 239;
pub const INTEROP_JID: u8 = 245;
pub const FB_JID: u8 = 246;
pub const AD_JID: u8 = 247;
pub const LIST_8: u8 = 248;
pub const LIST_16: u8 = 249;
pub const JID_PAIR: u8 = 250;
pub const HEX_8: u8 = 251;
pub const BINARY_8: u8 = 252;
pub const BINARY_20: u8 = 253;
pub const BINARY_32: u8 = 254;
pub const NIBBLE_8: u8 = 255;

/// Longest string that may be nibble or hex packed.
pub const PACKED_MAX: usize = 127;

/// Single-byte tokens. Index 0 is reserved for `LIST_EMPTY`.
pub static SINGLE_BYTE_TOKENS: &[&str] = &[
    "", "xmlstreamstart", "xmlstreamend", "s.whatsapp.net", "type", "participant", "from",
    "receipt", "id", "notification", "disappearing_mode", "status", "jid", "broadcast", "user",
    "devices", "device_hash", "to", "offline", "message", "result", "class", "xmlns",
    "duration", "notify", "iq", "t", "ack", "g.us", "enc", "urn:xmpp:whatsapp:push", "presence",
    "config_value", "picture", "verified_name", "config_code", "key-index-list", "contact",
    "mediatype", "routing_info", "edge_routing", "get", "read", "urn:xmpp:ping",
    "fallback_hostname", "0", "chatstate", "business_hours_config", "unavailable",
    "download_buckets", "skmsg", "verified_level", "composing", "handshake", "device-list",
    "media", "text", "fallback_ip4", "media_conn", "device", "creation", "location", "config",
    "item", "fallback_ip6", "count", "w:profile:picture", "image", "business", "2", "hostname",
    "call-creator", "display_name", "relaylatency", "platform", "abprops", "success", "msg",
    "offline_preview", "prop", "key-index", "v", "day_of_week", "pkmsg", "version", "1", "ping",
    "w:p", "download", "video", "set", "specific_hours", "props", "primary", "unknown", "hash",
    "commerce_experience", "last", "subscribe", "max_buckets", "call", "profile",
    "member_since_text", "close_time", "call-id", "sticker", "mode", "participants", "value",
    "query", "profile_options", "open_time", "code", "list", "host", "ts", "contacts", "upload",
    "lid", "preview", "update", "usync", "w:stats", "delivery", "auth_ttl", "context", "fail",
    "cart_enabled", "appdata", "category", "atn", "direct_connection", "decrypt-fail",
    "relay_id", "mmg-fallback.whatsapp.net", "target", "available", "name", "last_id",
    "mmg.whatsapp.net", "categories", "401", "is_new", "index", "tctoken", "ip4", "token_id",
    "latency", "recipient", "edit", "ip6", "add", "thumbnail-document", "26", "paused", "true",
    "identity", "stream:error", "key", "sidelist", "background", "audio", "3",
    "thumbnail-image", "biz-cover-photo", "cat", "gcm", "thumbnail-video", "error", "auth",
    "deny", "serial", "in", "registration", "thumbnail-link", "remove", "00", "gif",
    "thumbnail-gif", "tag", "capability", "multicast", "item-not-found", "description",
    "business_hours", "config_expo_key", "md-app-state", "expiration", "fallback", "ttl", "300",
    "md-msg-hist", "device_orientation", "out", "w:m", "open_24h", "side_list", "token",
    "inactive", "01", "document", "te2", "played", "encrypt", "msgr", "hide", "direct_path",
    "12", "state", "not-authorized", "url", "terminate", "signature", "status-revoke-delay",
    "02", "te", "linked_accounts", "trusted_contact", "timezone", "ptt", "kyc-id",
    "privacy_token", "readreceipts", "appointment_only", "address", "expected_ts", "privacy",
    "7", "android", "interactive", "device-identity", "enabled", "attribute_padding", "1080",
    "03", "screen_height",
];

lazy_static::lazy_static! {
    static ref TOKEN_INDEX: HashMap<&'static str, u8> = SINGLE_BYTE_TOKENS
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, token)| (*token, i as u8))
        .collect();
}

/// Token byte for a dictionary string.
pub fn get_token_index(s: &str) -> Option<u8> {
    TOKEN_INDEX.get(s).copied()
}

/// Dictionary string for a token byte. Index 0 and markers have none.
pub fn get_token(index: u8) -> Option<&'static str> {
    match index {
        0 => None,
        i => SINGLE_BYTE_TOKENS.get(i as usize).copied(),
    }
}
