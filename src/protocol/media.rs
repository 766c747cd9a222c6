//! Media connection info and HTTP transfer of encrypted media.

use std::io::Read;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

use crate::binary::Node;
use crate::crypto::{EncryptedMedia, MediaType};
use crate::proto::ImageMessage;
use crate::socket::endpoints;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },
    #[error("failed to read response body: {0}")]
    Io(#[from] std::io::Error),
    #[error("no media hosts available")]
    NoHosts,
    #[error("media message has neither url nor direct path")]
    NoUrl,
    #[error("invalid media_conn response")]
    BadMediaConn,
}

/// Upload credentials and hosts from the `w:m` media_conn IQ.
#[derive(Debug, Clone)]
pub struct MediaConn {
    pub auth: String,
    pub ttl: Duration,
    pub hosts: Vec<String>,
    pub fetched_at: Instant,
}

impl MediaConn {
    /// Parse the `<media_conn>` child of the IQ result.
    pub fn from_node(iq: &Node) -> Result<Self, TransferError> {
        let conn = iq
            .get_child_by_tag("media_conn")
            .ok_or(TransferError::BadMediaConn)?;
        let auth = conn
            .get_attr_str("auth")
            .ok_or(TransferError::BadMediaConn)?
            .to_string();
        let ttl = conn.get_attr_int("ttl").unwrap_or(0).max(0) as u64;
        let hosts = conn
            .get_children_by_tag("host")
            .filter_map(|h| h.get_attr_str("hostname"))
            .map(String::from)
            .collect();
        Ok(Self {
            auth,
            ttl: Duration::from_secs(ttl),
            hosts,
            fetched_at: Instant::now(),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// Everything needed to fetch and decrypt one media file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDownload {
    pub url: Option<String>,
    pub direct_path: Option<String>,
    pub media_key: Vec<u8>,
    pub file_enc_sha256: Option<Vec<u8>>,
    pub file_sha256: Option<Vec<u8>>,
    pub media_type: MediaType,
}

impl From<&ImageMessage> for MediaDownload {
    fn from(image: &ImageMessage) -> Self {
        Self {
            url: image.url.clone(),
            direct_path: image.direct_path.clone(),
            media_key: image.media_key.clone().unwrap_or_default(),
            file_enc_sha256: image.file_enc_sha256.clone(),
            file_sha256: image.file_sha256.clone(),
            media_type: MediaType::Image,
        }
    }
}

impl MediaDownload {
    /// Candidate URLs: the message URL first, then each media host.
    pub fn urls(&self, hosts: &[String]) -> Vec<String> {
        let mut urls: Vec<String> = self.url.iter().filter(|u| !u.is_empty()).cloned().collect();
        if let Some(path) = self.direct_path.as_deref().filter(|p| !p.is_empty()) {
            urls.extend(hosts.iter().map(|host| format!("https://{host}{path}")));
        }
        urls
    }
}

/// Result of an upload, ready to be copied into a media message.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    pub url: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_length: u64,
}

#[derive(Debug, Deserialize)]
struct UploadReply {
    url: String,
    direct_path: String,
}

/// Upload token: URL-safe base64 of the encrypted file hash.
pub fn upload_token(file_enc_sha256: &[u8]) -> String {
    URL_SAFE.encode(file_enc_sha256)
}

pub fn upload_url(host: &str, media_type: MediaType, token: &str) -> String {
    format!("https://{host}/mms/{}/{token}", media_type.mms_type())
}

fn http_error(url: &str, e: ureq::Error) -> TransferError {
    TransferError::Http {
        url: url.to_string(),
        reason: e.to_string(),
    }
}

/// Blocking GET of an encrypted media file.
pub fn http_download(url: &str) -> Result<Vec<u8>, TransferError> {
    let response = ureq::get(url)
        .set("Origin", endpoints::ORIGIN)
        .call()
        .map_err(|e| http_error(url, e))?;
    let mut body = Vec::new();
    response.into_reader().read_to_end(&mut body)?;
    Ok(body)
}

/// Blocking POST of an encrypted media file to one host.
pub fn http_upload(
    host: &str,
    auth: &str,
    media_type: MediaType,
    encrypted: EncryptedMedia,
) -> Result<UploadResponse, TransferError> {
    let token = upload_token(&encrypted.file_enc_sha256);
    let url = upload_url(host, media_type, &token);
    let reply: UploadReply = ureq::post(&url)
        .query("auth", auth)
        .query("token", &token)
        .set("Origin", endpoints::ORIGIN)
        .set("Content-Type", "application/octet-stream")
        .send_bytes(&encrypted.data)
        .map_err(|e| http_error(&url, e))?
        .into_json()?;

    Ok(UploadResponse {
        url: reply.url,
        direct_path: reply.direct_path,
        media_key: encrypted.media_key.to_vec(),
        file_enc_sha256: encrypted.file_enc_sha256.to_vec(),
        file_sha256: encrypted.file_sha256.to_vec(),
        file_length: encrypted.file_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_media_conn() {
        let iq = Node::new("iq").with_children(vec![Node::new("media_conn")
            .with_attr("auth", "AUTH")
            .with_attr("ttl", "300")
            .with_children(vec![
                Node::new("host").with_attr("hostname", "mmg.whatsapp.net"),
                Node::new("host").with_attr("hostname", "media.fcgk1-1.fna.whatsapp.net"),
            ])]);

        let conn = MediaConn::from_node(&iq).unwrap();
        assert_eq!(conn.auth, "AUTH");
        assert_eq!(conn.ttl, Duration::from_secs(300));
        assert_eq!(conn.hosts.len(), 2);
        assert!(!conn.is_expired());

        assert!(MediaConn::from_node(&Node::new("iq")).is_err());
    }

    #[test]
    fn zero_ttl_is_expired() {
        let iq = Node::new("iq")
            .with_children(vec![Node::new("media_conn").with_attr("auth", "A")]);
        assert!(MediaConn::from_node(&iq).unwrap().is_expired());
    }

    #[test]
    fn download_urls_prefer_message_url() {
        let image = ImageMessage {
            url: Some("https://mmg.whatsapp.net/d/f/abc.enc".into()),
            direct_path: Some("/v/t62/abc".into()),
            media_key: Some(vec![1; 32]),
            ..Default::default()
        };
        let download = MediaDownload::from(&image);
        let urls = download.urls(&["mmg.whatsapp.net".to_string()]);
        assert_eq!(
            urls,
            vec![
                "https://mmg.whatsapp.net/d/f/abc.enc",
                "https://mmg.whatsapp.net/v/t62/abc"
            ]
        );
        assert_eq!(download.media_type, MediaType::Image);
    }

    #[test]
    fn upload_url_uses_url_safe_token() {
        let token = upload_token(&[0xfb, 0xff, 0xfe]);
        assert_eq!(token, "-__-");
        assert_eq!(
            upload_url("mmg.whatsapp.net", MediaType::Image, &token),
            "https://mmg.whatsapp.net/mms/image/-__-"
        );
    }
}
