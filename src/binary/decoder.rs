//! Binary decoder for WhatsApp protocol.
//!
//! Decodes WhatsApp's binary XML format into Node structures.

use thiserror::Error;

use super::node::{AttrValue, Attrs, Node, NodeContent};
use super::token::*;
use crate::types::JID;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("unexpected end of data at position {0}")]
    UnexpectedEof(usize),
    #[error("invalid token {0} at position {1}")]
    InvalidToken(u8, usize),
    #[error("unsupported token {0}")]
    UnsupportedToken(u8),
    #[error("invalid node")]
    InvalidNode,
    #[error("invalid packed character {0:#x}")]
    InvalidPackedChar(u8),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("{0} leftover bytes after node")]
    LeftoverBytes(usize),
    #[error("compressed frames are not supported")]
    Compressed,
}

/// Value read from the stream before it is known where it lands.
enum Value {
    Empty,
    String(String),
    Bytes(Vec<u8>),
    JID(JID),
    List(Vec<Node>),
}

/// Binary decoder for WhatsApp XML nodes
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Decode one node that must consume all of `data`.
    pub fn decode(data: &'a [u8]) -> Result<Node, DecodeError> {
        let mut decoder = Self::new(data);
        let node = decoder.read_node()?;
        match data.len() - decoder.pos {
            0 => Ok(node),
            n => Err(DecodeError::LeftoverBytes(n)),
        }
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        let end = end.ok_or(DecodeError::UnexpectedEof(self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_int_n(&mut self, n: usize) -> Result<usize, DecodeError> {
        Ok(self
            .read_bytes(n)?
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize))
    }

    fn read_int20(&mut self) -> Result<usize, DecodeError> {
        Ok(self.read_int_n(3)? & 0x0F_FFFF)
    }

    fn read_list_size(&mut self, tag: u8) -> Result<usize, DecodeError> {
        match tag {
            LIST_EMPTY => Ok(0),
            LIST_8 => self.read_int_n(1),
            LIST_16 => self.read_int_n(2),
            other => Err(DecodeError::InvalidToken(other, self.pos - 1)),
        }
    }

    fn read_packed(&mut self, tag: u8) -> Result<String, DecodeError> {
        let start = self.read_byte()?;
        let mut out = String::with_capacity((start & 0x7F) as usize * 2);
        for _ in 0..(start & 0x7F) {
            let b = self.read_byte()?;
            out.push(unpack(tag, b >> 4)?);
            out.push(unpack(tag, b & 0x0F)?);
        }
        if start & 0x80 != 0 {
            out.pop();
        }
        Ok(out)
    }

    fn read_value(&mut self) -> Result<Value, DecodeError> {
        let tag = self.read_byte()?;
        match tag {
            LIST_EMPTY => Ok(Value::Empty),
            LIST_8 | LIST_16 => {
                let size = self.read_list_size(tag)?;
                let nodes = (0..size)
                    .map(|_| self.read_node())
                    .collect::<Result<_, _>>()?;
                Ok(Value::List(nodes))
            }
            BINARY_8 => {
                let n = self.read_int_n(1)?;
                Ok(Value::Bytes(self.read_bytes(n)?.to_vec()))
            }
            BINARY_20 => {
                let n = self.read_int20()?;
                Ok(Value::Bytes(self.read_bytes(n)?.to_vec()))
            }
            BINARY_32 => {
                let n = self.read_int_n(4)?;
                Ok(Value::Bytes(self.read_bytes(n)?.to_vec()))
            }
            JID_PAIR => {
                let user = match self.read_value()? {
                    Value::Empty => String::new(),
                    other => into_string(other)?,
                };
                let server = self.read_string()?;
                Ok(Value::JID(JID::new(user, server)))
            }
            AD_JID => {
                let agent = self.read_byte()?;
                let device = self.read_byte()?;
                let user = self.read_string()?;
                Ok(Value::JID(JID::new_ad(user, agent, device)))
            }
            NIBBLE_8 | HEX_8 => Ok(Value::String(self.read_packed(tag)?)),
            DICTIONARY_0..=DICTIONARY_3 | INTEROP_JID | FB_JID => {
                Err(DecodeError::UnsupportedToken(tag))
            }
            _ => get_token(tag)
                .map(|s| Value::String(s.to_string()))
                .ok_or(DecodeError::InvalidToken(tag, self.pos - 1)),
        }
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        into_string(self.read_value()?)
    }

    fn read_attrs(&mut self, count: usize) -> Result<Attrs, DecodeError> {
        let mut attrs = Attrs::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = match self.read_value()? {
                Value::JID(jid) => AttrValue::JID(jid),
                other => AttrValue::String(into_string(other)?),
            };
            attrs.insert(key, value);
        }
        Ok(attrs)
    }

    fn read_node(&mut self) -> Result<Node, DecodeError> {
        let list_tag = self.read_byte()?;
        let size = self.read_list_size(list_tag)?;
        if size == 0 {
            return Err(DecodeError::InvalidNode);
        }
        let tag = self.read_string()?;
        if tag.is_empty() {
            return Err(DecodeError::InvalidNode);
        }
        let attrs = self.read_attrs((size - 1) / 2)?;

        let content = if size % 2 == 1 {
            NodeContent::None
        } else {
            match self.read_value()? {
                Value::Empty => NodeContent::None,
                Value::List(nodes) => NodeContent::Children(nodes),
                Value::Bytes(bytes) => NodeContent::Bytes(bytes),
                Value::String(s) => NodeContent::Bytes(s.into_bytes()),
                Value::JID(jid) => NodeContent::Bytes(jid.to_string().into_bytes()),
            }
        };

        Ok(Node { tag, attrs, content })
    }
}

fn into_string(value: Value) -> Result<String, DecodeError> {
    match value {
        Value::Empty => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Bytes(bytes) => String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8),
        Value::JID(jid) => Ok(jid.to_string()),
        Value::List(_) => Err(DecodeError::InvalidNode),
    }
}

fn unpack(tag: u8, value: u8) -> Result<char, DecodeError> {
    let c = match (tag, value) {
        (_, 0..=9) => b'0' + value,
        (NIBBLE_8, 10) => b'-',
        (NIBBLE_8, 11) => b'.',
        (HEX_8, 10..=15) => b'A' + value - 10,
        // padding nibble, dropped by the odd-length flag
        (NIBBLE_8, 15) => 0,
        _ => return Err(DecodeError::InvalidPackedChar(value)),
    };
    Ok(c as char)
}

/// Decode frame payload: flags byte followed by the node.
pub fn unmarshal(data: &[u8]) -> Result<Node, DecodeError> {
    let (&flags, rest) = data.split_first().ok_or(DecodeError::UnexpectedEof(0))?;
    if flags & 2 != 0 {
        return Err(DecodeError::Compressed);
    }
    Decoder::decode(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::encoder::{marshal, Encoder};

    #[test]
    fn decodes_what_the_encoder_writes() {
        let from: JID = "15551234567@s.whatsapp.net".parse().unwrap();
        let device: JID = "15551234567:12@s.whatsapp.net".parse().unwrap();
        let node = Node::new("message")
            .with_attr("id", "3EB0C431C26A1916E0FA")
            .with_attr("from", from)
            .with_attr("participant", device)
            .with_attr("t", "1700000000")
            .with_attr("notify", "Jane Doe")
            .with_children(vec![
                Node::new("plaintext").with_bytes(vec![0u8, 1, 2, 255]),
                Node::new("ping"),
            ]);

        let decoded = unmarshal(&marshal(&node)).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn odd_length_nibble_string_drops_padding() {
        let node = Node::new("iq").with_attr("id", "12.34-5");
        let decoded = Decoder::decode(&Encoder::encode(&node)).unwrap();
        assert_eq!(decoded.get_attr_str("id"), Some("12.34-5"));
    }

    #[test]
    fn server_jid_with_empty_user() {
        let node = Node::new("iq").with_attr("to", JID::new("", "s.whatsapp.net"));
        let decoded = Decoder::decode(&Encoder::encode(&node)).unwrap();
        assert_eq!(decoded.get_attr_jid("to").unwrap().to_string(), "s.whatsapp.net");
    }

    #[test]
    fn rejects_truncated_and_trailing_data() {
        let encoded = Encoder::encode(&Node::new("iq").with_attr("type", "get"));
        assert!(matches!(
            Decoder::decode(&encoded[..encoded.len() - 1]),
            Err(DecodeError::UnexpectedEof(_))
        ));

        let mut extra = encoded.clone();
        extra.push(0);
        assert_eq!(Decoder::decode(&extra), Err(DecodeError::LeftoverBytes(1)));
    }

    #[test]
    fn rejects_compressed_frames_and_dictionary_tokens() {
        assert_eq!(unmarshal(&[2, LIST_8, 1, 25]), Err(DecodeError::Compressed));
        assert_eq!(
            Decoder::decode(&[LIST_8, 1, DICTIONARY_0, 0]),
            Err(DecodeError::UnsupportedToken(DICTIONARY_0))
        );
        assert_eq!(Decoder::decode(&[LIST_EMPTY]), Err(DecodeError::InvalidNode));
    }
}
