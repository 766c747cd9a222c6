//! End-to-end message content.
//!
//! Only the message kinds the bot reads or writes are modelled: plain
//! conversation text, images and buttons messages. Field numbers follow
//! the WhatsApp `Message` schema so payloads stay compatible.

use prost::Message as ProstMessage;

#[derive(Clone, PartialEq, ProstMessage)]
pub struct Message {
    #[prost(string, optional, tag = "1")]
    pub conversation: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub image_message: Option<ImageMessage>,
    #[prost(message, optional, tag = "42")]
    pub buttons_message: Option<ButtonsMessage>,
}

impl Message {
    /// A plain text message.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            conversation: Some(body.into()),
            ..Default::default()
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        if self.conversation.is_some() {
            "text"
        } else if self.image_message.is_some() {
            "image"
        } else if self.buttons_message.is_some() {
            "buttons"
        } else {
            "unknown"
        }
    }

    /// Value of the `type` attribute on the outgoing message stanza.
    pub fn stanza_type(&self) -> &'static str {
        if self.image_message.is_some() {
            "media"
        } else {
            "text"
        }
    }
}

#[derive(Clone, PartialEq, ProstMessage)]
pub struct ImageMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub caption: Option<String>,
    #[prost(bytes, optional, tag = "4")]
    pub file_sha256: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "5")]
    pub file_length: Option<u64>,
    #[prost(uint32, optional, tag = "6")]
    pub height: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub width: Option<u32>,
    #[prost(bytes, optional, tag = "8")]
    pub media_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "9")]
    pub file_enc_sha256: Option<Vec<u8>>,
    #[prost(string, optional, tag = "11")]
    pub direct_path: Option<String>,
    #[prost(int64, optional, tag = "12")]
    pub media_key_timestamp: Option<i64>,
    #[prost(message, optional, tag = "17")]
    pub context_info: Option<ContextInfo>,
}

#[derive(Clone, PartialEq, ProstMessage)]
pub struct ContextInfo {
    #[prost(string, optional, tag = "1")]
    pub stanza_id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub participant: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub remote_jid: Option<String>,
    #[prost(string, repeated, tag = "15")]
    pub mentioned_jid: Vec<String>,
}

#[derive(Clone, PartialEq, ProstMessage)]
pub struct ButtonsMessage {
    #[prost(string, optional, tag = "6")]
    pub content_text: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub footer_text: Option<String>,
    #[prost(message, optional, tag = "8")]
    pub context_info: Option<ContextInfo>,
    #[prost(message, repeated, tag = "9")]
    pub buttons: Vec<Button>,
}

#[derive(Clone, PartialEq, ProstMessage)]
pub struct Button {
    #[prost(string, optional, tag = "1")]
    pub button_id: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub button_text: Option<ButtonText>,
    #[prost(enumeration = "ButtonType", optional, tag = "3")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "4")]
    pub native_flow_info: Option<NativeFlowInfo>,
}

#[derive(Clone, PartialEq, ProstMessage)]
pub struct ButtonText {
    #[prost(string, optional, tag = "1")]
    pub display_text: Option<String>,
}

#[derive(Clone, PartialEq, ProstMessage)]
pub struct NativeFlowInfo {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub params_json: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ButtonType {
    Unknown = 0,
    Response = 1,
    NativeFlow = 2,
}

/// Device identity blob sent by the server in `pair-success`.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct AdvSignedDeviceIdentityHmac {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub hmac: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buttons_message_keeps_enum_type() {
        let msg = Message {
            buttons_message: Some(ButtonsMessage {
                content_text: Some("Content".into()),
                buttons: vec![Button {
                    button_id: Some("ButtonId".into()),
                    r#type: Some(ButtonType::Response as i32),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let decoded = Message::decode(&msg.encode_to_vec()[..]).unwrap();
        let button = &decoded.buttons_message.unwrap().buttons[0];
        assert_eq!(button.r#type(), ButtonType::Response);
        assert_eq!(decoded.conversation, None);
    }

    #[test]
    fn kind_and_stanza_type_follow_content() {
        assert_eq!(Message::text("hi").kind(), "text");
        assert_eq!(Message::text("hi").stanza_type(), "text");

        let image = Message {
            image_message: Some(ImageMessage::default()),
            ..Default::default()
        };
        assert_eq!(image.kind(), "image");
        assert_eq!(image.stanza_type(), "media");
        assert_eq!(Message::default().kind(), "unknown");
    }
}
