//! Binary encoder for WhatsApp protocol.
//!
//! Encodes Node structures into WhatsApp's binary XML format.

use super::node::{AttrValue, Node, NodeContent};
use super::token::*;
use crate::types::JID;

/// Binary encoder for WhatsApp XML nodes
#[derive(Default)]
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a node without the leading flags byte.
    pub fn encode(node: &Node) -> Vec<u8> {
        let mut encoder = Self::new();
        encoder.write_node(node);
        encoder.data
    }

    fn write_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    fn write_list_start(&mut self, size: usize) {
        if size == 0 {
            self.write_byte(LIST_EMPTY);
        } else if size < 256 {
            self.write_byte(LIST_8);
            self.write_byte(size as u8);
        } else {
            self.write_byte(LIST_16);
            self.data.extend_from_slice(&(size as u16).to_be_bytes());
        }
    }

    fn write_byte_length(&mut self, len: usize) {
        if len < 256 {
            self.write_byte(BINARY_8);
            self.write_byte(len as u8);
        } else if len < 1 << 20 {
            self.write_byte(BINARY_20);
            self.write_byte(((len >> 16) & 0x0F) as u8);
            self.write_byte(((len >> 8) & 0xFF) as u8);
            self.write_byte((len & 0xFF) as u8);
        } else {
            self.write_byte(BINARY_32);
            self.data.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }

    fn write_raw_bytes(&mut self, bytes: &[u8]) {
        self.write_byte_length(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    fn write_string(&mut self, s: &str) {
        if let Some(token) = get_token_index(s) {
            self.write_byte(token);
        } else if is_packable(s, pack_nibble) {
            self.write_packed(s, NIBBLE_8, pack_nibble);
        } else if is_packable(s, pack_hex) {
            self.write_packed(s, HEX_8, pack_hex);
        } else {
            self.write_raw_bytes(s.as_bytes());
        }
    }

    fn write_packed(&mut self, s: &str, tag: u8, pack: fn(u8) -> Option<u8>) {
        let bytes = s.as_bytes();
        let mut rounded = bytes.len().div_ceil(2) as u8;
        if bytes.len() % 2 != 0 {
            rounded |= 0x80;
        }
        self.write_byte(tag);
        self.write_byte(rounded);

        // 0x0F pads an odd final nibble
        for pair in bytes.chunks(2) {
            let high = pack(pair[0]).unwrap_or(0x0F);
            let low = pair.get(1).and_then(|&c| pack(c)).unwrap_or(0x0F);
            self.write_byte((high << 4) | low);
        }
    }

    fn write_jid(&mut self, jid: &JID) {
        if jid.raw_agent > 0 || jid.device > 0 {
            self.write_byte(AD_JID);
            self.write_byte(jid.raw_agent);
            self.write_byte(jid.device as u8);
            self.write_string(&jid.user);
        } else {
            self.write_byte(JID_PAIR);
            if jid.user.is_empty() {
                self.write_byte(LIST_EMPTY);
            } else {
                self.write_string(&jid.user);
            }
            self.write_string(&jid.server);
        }
    }

    fn write_attr_value(&mut self, value: &AttrValue) {
        match value {
            AttrValue::String(s) => self.write_string(s),
            AttrValue::JID(jid) => self.write_jid(jid),
        }
    }

    fn write_node(&mut self, node: &Node) {
        let has_content = !matches!(node.content, NodeContent::None);
        self.write_list_start(2 * node.attrs.len() + 1 + has_content as usize);
        self.write_string(&node.tag);

        for (key, value) in &node.attrs {
            self.write_string(key);
            self.write_attr_value(value);
        }

        match &node.content {
            NodeContent::None => {}
            NodeContent::Bytes(bytes) => self.write_raw_bytes(bytes),
            NodeContent::Children(children) => {
                self.write_list_start(children.len());
                for child in children {
                    self.write_node(child);
                }
            }
        }
    }
}

fn is_packable(s: &str, pack: fn(u8) -> Option<u8>) -> bool {
    !s.is_empty() && s.len() <= PACKED_MAX && s.bytes().all(|c| pack(c).is_some())
}

fn pack_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'-' => Some(10),
        b'.' => Some(11),
        _ => None,
    }
}

fn pack_hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(10 + c - b'A'),
        _ => None,
    }
}

/// Encode a node as frame payload: flags byte followed by the node.
pub fn marshal(node: &Node) -> Vec<u8> {
    let mut out = vec![0u8];
    out.extend(Encoder::encode(node));
    out
}
