//! Message, receipt and ack stanzas.
//!
//! Payloads travel as a serialized `Message` protobuf inside a
//! `<plaintext>` child. Incoming stanzas that only carry `<enc>` children
//! cannot be read by this client.

use prost::Message as ProstMessage;
use thiserror::Error;

use crate::binary::Node;
use crate::proto;
use crate::types::{
    unix_time, Event, Message, MessageInfo, Receipt, ReceiptType, UndecryptableMessage, JID,
};

#[derive(Debug, Error)]
pub enum StanzaError {
    #[error("missing attribute {0:?} on <{1}>")]
    MissingAttr(&'static str, String),
    #[error("failed to decode message payload: {0}")]
    Proto(#[from] prost::DecodeError),
}

/// Build an outgoing `<message>` stanza.
pub fn build_message_node(id: &str, to: &JID, message: &proto::Message) -> Node {
    let mut plaintext = Node::new("plaintext").with_bytes(message.encode_to_vec());
    if message.image_message.is_some() {
        plaintext.set_attr("mediatype", "image");
    }
    Node::new("message")
        .with_attr("id", id)
        .with_attr("type", message.stanza_type())
        .with_attr("to", to)
        .with_children(vec![plaintext])
}

/// Delivery receipt for an incoming message.
pub fn build_receipt(message: &Node) -> Option<Node> {
    let id = message.get_attr_str("id")?;
    let from = message.get_attr_jid("from")?;
    let mut receipt = Node::new("receipt").with_attr("id", id).with_attr("to", from);
    if let Some(participant) = message.get_attr_jid("participant") {
        receipt.set_attr("participant", participant);
    }
    Some(receipt)
}

/// Ack for an incoming receipt or notification.
pub fn build_ack(node: &Node) -> Node {
    let mut ack = Node::new("ack").with_attr("class", node.tag.as_str());
    for key in ["id", "participant"] {
        if let Some(value) = node.get_attr(key) {
            ack.set_attr(key, value.clone());
        }
    }
    if let Some(from) = node.get_attr_jid("from") {
        ack.set_attr("to", from);
    }
    if node.tag != "message" {
        if let Some(ack_type) = node.get_attr_str("type") {
            ack.set_attr("type", ack_type);
        }
    }
    ack
}

/// Read the metadata of a `<message>` stanza.
pub fn parse_message_info(node: &Node, own_jid: Option<&JID>) -> Result<MessageInfo, StanzaError> {
    let missing = |attr| StanzaError::MissingAttr(attr, node.tag.clone());
    let id = node.get_attr_str("id").ok_or_else(|| missing("id"))?;
    let chat = node.get_attr_jid("from").ok_or_else(|| missing("from"))?;

    let is_group = chat.is_group() || chat.server == crate::types::servers::BROADCAST;
    let sender = match node.get_attr_jid("participant") {
        Some(participant) if is_group => participant,
        _ => chat.clone(),
    };
    let is_from_me = own_jid.is_some_and(|own| own.user == sender.user);

    Ok(MessageInfo {
        id: id.to_string(),
        chat: chat.to_non_ad(),
        sender,
        is_from_me,
        is_group: chat.is_group(),
        timestamp: unix_time(node.get_attr_int("t").unwrap_or_default()),
        push_name: node.get_attr_str("notify").unwrap_or_default().to_string(),
        msg_type: node.get_attr_str("type").unwrap_or_default().to_string(),
    })
}

/// Turn a `<message>` stanza into the event handed to handlers.
pub fn parse_message(node: &Node, own_jid: Option<&JID>) -> Result<Event, StanzaError> {
    let info = parse_message_info(node, own_jid)?;
    match node.get_child_by_tag("plaintext").and_then(Node::get_bytes) {
        Some(payload) => {
            let message = proto::Message::decode(payload)?;
            Ok(Event::Message(Box::new(Message { info, message })))
        }
        None => Ok(Event::UndecryptableMessage(UndecryptableMessage { info })),
    }
}

/// Read a `<receipt>` stanza. Batched receipts list extra ids in `<list><item/></list>`.
pub fn parse_receipt(node: &Node) -> Result<Receipt, StanzaError> {
    let missing = |attr| StanzaError::MissingAttr(attr, node.tag.clone());
    let id = node.get_attr_str("id").ok_or_else(|| missing("id"))?;
    let chat = node.get_attr_jid("from").ok_or_else(|| missing("from"))?;

    let mut message_ids = vec![id.to_string()];
    if let Some(list) = node.get_child_by_tag("list") {
        message_ids.extend(
            list.get_children_by_tag("item")
                .filter_map(|item| item.get_attr_str("id"))
                .map(String::from),
        );
    }

    Ok(Receipt {
        message_ids,
        sender: node.get_attr_jid("participant").unwrap_or_else(|| chat.clone()),
        chat,
        receipt_type: ReceiptType::from_attr(node.get_attr_str("type")),
        timestamp: unix_time(node.get_attr_int("t").unwrap_or_default()),
    })
}
