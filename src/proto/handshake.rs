//! Noise handshake messages and the client payload sent inside them.

use prost::Message;

use crate::types::JID;

/// Envelope for the three Noise handshake messages.
#[derive(Clone, PartialEq, Message)]
pub struct HandshakeMessage {
    #[prost(message, optional, tag = "2")]
    pub client_hello: Option<ClientHello>,
    #[prost(message, optional, tag = "3")]
    pub server_hello: Option<ServerHello>,
    #[prost(message, optional, tag = "4")]
    pub client_finish: Option<ClientFinish>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClientHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClientFinish {
    #[prost(bytes, optional, tag = "1")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
}

/// Client payload sent encrypted in the last handshake message.
#[derive(Clone, PartialEq, Message)]
pub struct ClientPayload {
    #[prost(uint64, optional, tag = "1")]
    pub username: Option<u64>,
    #[prost(bool, optional, tag = "3")]
    pub passive: Option<bool>,
    #[prost(message, optional, tag = "5")]
    pub user_agent: Option<UserAgent>,
    #[prost(message, optional, tag = "6")]
    pub web_info: Option<WebInfo>,
    #[prost(string, optional, tag = "7")]
    pub push_name: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub session_id: Option<i32>,
    #[prost(bool, optional, tag = "10")]
    pub short_connect: Option<bool>,
    #[prost(int32, optional, tag = "12")]
    pub connect_type: Option<i32>,
    #[prost(int32, optional, tag = "13")]
    pub connect_reason: Option<i32>,
    #[prost(uint32, optional, tag = "18")]
    pub device: Option<u32>,
    #[prost(message, optional, tag = "19")]
    pub device_pairing_data: Option<DevicePairingData>,
    #[prost(bool, optional, tag = "23")]
    pub oc: Option<bool>,
    #[prost(bool, optional, tag = "33")]
    pub pull: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserAgent {
    #[prost(int32, optional, tag = "1")]
    pub platform: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub app_version: Option<AppVersion>,
    #[prost(int32, optional, tag = "3")]
    pub release_channel: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub mcc: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub mnc: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub os_version: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub manufacturer: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub device: Option<String>,
    #[prost(string, optional, tag = "9")]
    pub os_build_number: Option<String>,
    #[prost(string, optional, tag = "11")]
    pub locale_language_iso6391: Option<String>,
    #[prost(string, optional, tag = "12")]
    pub locale_country_iso31661_alpha2: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppVersion {
    #[prost(uint32, optional, tag = "1")]
    pub primary: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub secondary: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub tertiary: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WebInfo {
    #[prost(int32, optional, tag = "4")]
    pub web_sub_platform: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DevicePairingData {
    #[prost(bytes, optional, tag = "1")]
    pub e_regid: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub e_keytype: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub e_ident: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub e_skey_id: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub e_skey_val: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "6")]
    pub e_skey_sig: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "7")]
    pub build_hash: Option<Vec<u8>>,
}

pub mod platform {
    pub const WEB: i32 = 14;
}

pub mod connect_type {
    pub const WIFI_UNKNOWN: i32 = 1;
}

pub mod connect_reason {
    pub const USER_ACTIVATED: i32 = 1;
}

pub mod web_sub_platform {
    pub const WEB_BROWSER: i32 = 0;
}

/// Web client version advertised in the user agent.
pub const WA_WEB_VERSION: [u32; 3] = [2, 3000, 1_012_170_356];

fn base_payload(push_name: Option<&str>) -> ClientPayload {
    let [primary, secondary, tertiary] = WA_WEB_VERSION;
    ClientPayload {
        user_agent: Some(UserAgent {
            platform: Some(platform::WEB),
            app_version: Some(AppVersion {
                primary: Some(primary),
                secondary: Some(secondary),
                tertiary: Some(tertiary),
            }),
            release_channel: Some(0),
            mcc: Some("000".to_string()),
            mnc: Some("000".to_string()),
            os_version: Some("0.1".to_string()),
            manufacturer: Some(String::new()),
            device: Some("Desktop".to_string()),
            os_build_number: Some("0.1".to_string()),
            locale_language_iso6391: Some("en".to_string()),
            locale_country_iso31661_alpha2: Some("US".to_string()),
        }),
        web_info: Some(WebInfo {
            web_sub_platform: Some(web_sub_platform::WEB_BROWSER),
        }),
        push_name: push_name.map(String::from),
        connect_type: Some(connect_type::WIFI_UNKNOWN),
        connect_reason: Some(connect_reason::USER_ACTIVATED),
        ..Default::default()
    }
}

/// Payload for a device that has not been paired yet.
pub fn make_registration_payload(
    push_name: Option<&str>,
    pairing_data: DevicePairingData,
) -> ClientPayload {
    ClientPayload {
        passive: Some(false),
        pull: Some(false),
        device_pairing_data: Some(pairing_data),
        ..base_payload(push_name)
    }
}

/// Payload for a device that already has a JID.
pub fn make_login_payload(push_name: Option<&str>, jid: &JID) -> ClientPayload {
    ClientPayload {
        username: Some(jid.user_int()),
        device: Some(jid.device as u32),
        passive: Some(false),
        pull: Some(true),
        ..base_payload(push_name)
    }
}

/// Create device pairing data for registration.
pub fn make_device_pairing_data(
    reg_id: u32,
    identity_key: &[u8; 32],
    signed_prekey_id: u32,
    signed_prekey: &[u8; 32],
    signed_prekey_sig: &[u8; 64],
) -> DevicePairingData {
    DevicePairingData {
        e_regid: Some(reg_id.to_be_bytes().to_vec()),
        e_keytype: Some(vec![5]),
        e_ident: Some(identity_key.to_vec()),
        // 3-byte big-endian key id
        e_skey_id: Some(signed_prekey_id.to_be_bytes()[1..].to_vec()),
        e_skey_val: Some(signed_prekey.to_vec()),
        e_skey_sig: Some(signed_prekey_sig.to_vec()),
        build_hash: None,
    }
}
