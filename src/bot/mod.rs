//! Reply bot driven by client events.
//!
//! Text messages get a `pong` for `ping` and a buttons message otherwise.
//! Images are downloaded, saved under the media directory, uploaded again
//! and echoed back to the chat. Every message is handled on its own task.

mod mime;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::BotConfig;
use crate::crypto::MediaType;
use crate::proto;
use crate::protocol::{Client, ClientError, MediaDownload, SendResponse, UploadResponse};
use crate::types::{Event, Message, JID, STATUS_USER};

pub use mime::{extensions_by_type, preferred_extension, DEFAULT_EXTENSION};

/// The client operations the bot needs.
#[async_trait]
pub trait BotClient: Send + Sync {
    async fn send_message(&self, to: &JID, message: proto::Message) -> Result<SendResponse, ClientError>;
    async fn download(&self, media: &MediaDownload) -> Result<Vec<u8>, ClientError>;
    async fn upload(&self, data: Vec<u8>, media_type: MediaType) -> Result<UploadResponse, ClientError>;
}

#[async_trait]
impl BotClient for Client {
    async fn send_message(&self, to: &JID, message: proto::Message) -> Result<SendResponse, ClientError> {
        Client::send_message(self, to, message).await
    }

    async fn download(&self, media: &MediaDownload) -> Result<Vec<u8>, ClientError> {
        Client::download(self, media).await
    }

    async fn upload(&self, data: Vec<u8>, media_type: MediaType) -> Result<UploadResponse, ClientError> {
        Client::upload(self, data, media_type).await
    }
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl BotError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| BotError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which responder a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Conversation,
    Image,
}

/// Pick the responder for `message`. Status broadcasts are never answered.
pub fn route(message: &Message) -> Option<Route> {
    if message.info.chat.user == STATUS_USER {
        return None;
    }
    if message.message.conversation.is_some() {
        Some(Route::Conversation)
    } else if message.message.image_message.is_some() {
        Some(Route::Image)
    } else {
        None
    }
}

/// Reply sent for any text other than `ping`.
pub fn buttons_message() -> proto::Message {
    proto::Message {
        buttons_message: Some(proto::ButtonsMessage {
            content_text: Some("Content".into()),
            footer_text: Some("Footer".into()),
            context_info: Some(proto::ContextInfo::default()),
            buttons: vec![proto::Button {
                button_id: Some("ButtonId".into()),
                button_text: Some(proto::ButtonText {
                    display_text: Some("Ok".into()),
                }),
                r#type: Some(proto::ButtonType::Response as i32),
                native_flow_info: Some(proto::NativeFlowInfo::default()),
            }],
        }),
        ..Default::default()
    }
}

/// Image message pointing at an uploaded file.
pub fn image_reply(caption: &str, upload: &UploadResponse) -> proto::Message {
    proto::Message {
        image_message: Some(proto::ImageMessage {
            caption: Some(caption.to_string()),
            mimetype: Some("image/jpeg".into()),
            url: Some(upload.url.clone()),
            direct_path: Some(upload.direct_path.clone()),
            media_key: Some(upload.media_key.clone()),
            file_enc_sha256: Some(upload.file_enc_sha256.clone()),
            file_sha256: Some(upload.file_sha256.clone()),
            file_length: Some(upload.file_length),
            height: Some(410),
            width: Some(1200),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct Bot {
    client: Arc<dyn BotClient>,
    config: BotConfig,
}

impl Bot {
    pub fn new(client: Arc<dyn BotClient>, config: BotConfig) -> Self {
        Self { client, config }
    }

    /// Callback for `Client::add_event_handler`.
    pub fn event_handler(self: &Arc<Self>) -> impl Fn(Event) + Send + Sync + 'static {
        let bot = Arc::clone(self);
        move |event| match event {
            Event::Message(message) => {
                let Some(target) = route(&message) else {
                    debug!("Ignoring message {} from {}", message.info.id, message.info.chat);
                    return;
                };
                let bot = Arc::clone(&bot);
                tokio::spawn(async move {
                    if let Err(e) = bot.handle(target, &message).await {
                        error!("Failed to handle message {}: {e}", message.info.id);
                    }
                });
            }
            other => debug!("Received {} event", other.name()),
        }
    }

    pub async fn handle(&self, route: Route, message: &Message) -> Result<(), BotError> {
        match route {
            Route::Conversation => self.handle_conversation(message).await,
            Route::Image => self.handle_image(message).await,
        }
    }

    pub async fn handle_conversation(&self, message: &Message) -> Result<(), BotError> {
        let chat = &message.info.chat;
        let body = message.message.conversation.as_deref().unwrap_or_default();

        if body == "ping" {
            self.client.send_message(chat, proto::Message::text("pong")).await?;
            return Ok(());
        }

        info!("not ping :)");
        let sent = self.client.send_message(chat, buttons_message()).await?;
        info!("Message sent (server timestamp: {})", sent.timestamp);
        Ok(())
    }

    pub async fn handle_image(&self, message: &Message) -> Result<(), BotError> {
        let Some(image) = message.message.image_message.as_ref() else {
            return Ok(());
        };
        let chat = &message.info.chat;
        let caption = image.caption.as_deref().unwrap_or_default();
        if !caption.is_empty() {
            info!("caption: {caption}");
        }

        let data = self.client.download(&MediaDownload::from(image)).await?;

        let mime = image.mimetype.as_deref().unwrap_or_default();
        let exts = extensions_by_type(mime);

        let dir = &self.config.media_dir;
        create_media_dir(dir).await?;
        info!("Folder created: {}", dir.display());

        let path = dir.join(media_file_name(&chat.user, &message.info.id, mime));
        write_private(&path, &data).await?;
        info!("Saved to server path at: {}", path.display());

        let content = tokio::fs::read(&path)
            .await
            .map_err(BotError::io("read", &path))?;
        let upload = self.client.upload(content, MediaType::Image).await?;

        let text = format!(
            "we received your image with MIME type: {mime} ({})",
            exts.join(", ")
        );
        self.client.send_message(chat, proto::Message::text(text)).await?;
        self.client.send_message(chat, image_reply(caption, &upload)).await?;
        Ok(())
    }
}

/// `<user>-<id><ext>`, with anything that could leave the media directory replaced.
fn media_file_name(user: &str, id: &str, mime: &str) -> String {
    format!(
        "{}-{}{}",
        file_name_part(user),
        file_name_part(id),
        preferred_extension(mime)
    )
}

fn file_name_part(raw: &str) -> String {
    let part: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if part.is_empty() || part.chars().all(|c| c == '.') {
        "_".repeat(part.len().max(1))
    } else {
        part
    }
}

async fn create_media_dir(dir: &Path) -> Result<(), BotError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(dir).await.map_err(BotError::io("create", dir))
}

/// Write `data` to a file only the owner can read.
async fn write_private(path: &Path, data: &[u8]) -> Result<(), BotError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await.map_err(BotError::io("open", path))?;
    file.write_all(data).await.map_err(BotError::io("write", path))?;
    file.flush().await.map_err(BotError::io("write", path))
}
