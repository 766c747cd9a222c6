//! Binary XML node type.

use std::collections::BTreeMap;
use std::fmt;

use crate::types::JID;

/// Attributes of a node, ordered so encoding is deterministic.
pub type Attrs = BTreeMap<String, AttrValue>;

/// Attribute values are either strings or JIDs on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    String(String),
    JID(JID),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<JID> for AttrValue {
    fn from(jid: JID) -> Self {
        AttrValue::JID(jid)
    }
}

impl From<&JID> for AttrValue {
    fn from(jid: &JID) -> Self {
        AttrValue::JID(jid.clone())
    }
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            AttrValue::JID(_) => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::JID(jid) => write!(f, "{jid}"),
        }
    }
}

/// Node represents a binary XML element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeContent {
    #[default]
    None,
    Children(Vec<Node>),
    Bytes(Vec<u8>),
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::None,
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder-style children setter.
    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Children(children);
        self
    }

    /// Builder-style bytes setter.
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn get_attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    /// String attribute. JID-valued attributes return `None`.
    pub fn get_attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(AttrValue::as_str)
    }

    /// JID attribute, parsing string values when needed.
    pub fn get_attr_jid(&self, key: &str) -> Option<JID> {
        match self.attrs.get(key)? {
            AttrValue::JID(jid) => Some(jid.clone()),
            AttrValue::String(s) => s.parse().ok(),
        }
    }

    pub fn get_attr_int(&self, key: &str) -> Option<i64> {
        self.get_attr_str(key)?.parse().ok()
    }

    pub fn add_child(&mut self, child: Node) {
        match &mut self.content {
            NodeContent::Children(children) => children.push(child),
            _ => self.content = NodeContent::Children(vec![child]),
        }
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.content = NodeContent::Bytes(bytes);
    }

    /// Child nodes, empty when the content is not a list.
    pub fn children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Children(children) => children,
            _ => &[],
        }
    }

    pub fn get_children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children().iter().filter(move |n| n.tag == tag)
    }

    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.children().iter().find(|n| n.tag == tag)
    }

    /// Walk nested tags, e.g. `["pair-success", "device"]`.
    pub fn get_optional_child_by_tag(&self, tags: &[&str]) -> Option<&Node> {
        tags.iter()
            .try_fold(self, |current, tag| current.get_child_by_tag(tag))
    }

    pub fn get_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// XML-ish rendering for debug logs.
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (key, value) in &self.attrs {
            write!(f, " {key}=\"{value}\"")?;
        }
        match &self.content {
            NodeContent::None => write!(f, "/>"),
            NodeContent::Bytes(bytes) => write!(f, "><!-- {} bytes --></{}>", bytes.len(), self.tag),
            NodeContent::Children(children) => {
                write!(f, ">")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_attrs_and_children() {
        let node = Node::new("iq")
            .with_attr("id", "1")
            .with_attr("type", "get")
            .with_children(vec![Node::new("ping")]);

        assert_eq!(node.get_attr_str("id"), Some("1"));
        assert_eq!(node.children().len(), 1);
        assert!(node.get_child_by_tag("ping").is_some());
        assert_eq!(node.to_string(), "<iq id=\"1\" type=\"get\"><ping/></iq>");
    }

    #[test]
    fn jid_attrs_parse_from_either_representation() {
        let jid: JID = "123@s.whatsapp.net".parse().unwrap();
        let node = Node::new("message")
            .with_attr("from", jid.clone())
            .with_attr("participant", "456@s.whatsapp.net");

        assert_eq!(node.get_attr_jid("from"), Some(jid));
        assert_eq!(node.get_attr_str("from"), None);
        assert_eq!(node.get_attr_jid("participant").unwrap().user, "456");
    }

    #[test]
    fn nested_lookup_walks_tags() {
        let node = Node::new("iq").with_children(vec![Node::new("pair-success")
            .with_children(vec![Node::new("device").with_attr("jid", "1@s.whatsapp.net")])]);

        let device = node.get_optional_child_by_tag(&["pair-success", "device"]).unwrap();
        assert_eq!(device.get_attr_str("jid"), Some("1@s.whatsapp.net"));
        assert!(node.get_optional_child_by_tag(&["pair-success", "biz"]).is_none());
    }
}
