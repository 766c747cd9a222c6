//! WhatsApp Client implementation.
//!
//! A `Client` owns one device and keeps a single connection alive. The
//! connection runs on a supervisor task: a writer task drains outgoing
//! frames from a channel while the read loop decodes stanzas, answers them
//! and hands events to the registered handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};

use super::media::{http_download, http_upload, MediaConn, MediaDownload, TransferError, UploadResponse};
use super::message::{build_ack, build_message_node, build_receipt, parse_message, parse_receipt};
use super::qr::{verify_pair_success, QRChannel, QREvent, QRPairing};
use super::request::{build_iq, build_iq_error, build_iq_result, generate_message_id, iq_error, RequestTracker};
use crate::binary::{marshal, unmarshal, DecodeError, Node};
use crate::crypto::{decrypt_media, encrypt_media, MediaError, MediaType};
use crate::proto;
use crate::socket::{
    endpoints, Connection, Dialer, FrameReader, FrameWriter, HandshakeError, NoiseDialer, SocketError,
};
use crate::store::{Device, DeviceStore, StoreError};
use crate::types::{
    unix_time, Connected, DisconnectReason, Disconnected, Event, LoggedOut, MessageID,
    PairSuccess, StreamError, JID, SERVER_JID,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint URL
    pub endpoint: String,
    /// `Origin` header sent with the websocket upgrade
    pub origin: String,
    /// Name announced with the available presence after login
    pub push_name: Option<String>,
    /// How long to wait for IQ responses, message acks and the handshake
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    /// How long a keepalive ping may go unanswered before it counts as failed
    pub keepalive_timeout: Duration,
    /// Reconnect after the connection drops
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::MAIN.to_string(),
            origin: endpoints::ORIGIN.to_string(),
            push_name: None,
            request_timeout: Duration::from_secs(75),
            keepalive_interval: Duration::from_secs(25),
            keepalive_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("already connected")]
    AlreadyConnected,
    #[error("already logged in")]
    AlreadyLoggedIn,
    #[error("request timed out")]
    Timeout,
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("server returned error {code}: {text}")]
    Iq { code: i64, text: String },
    #[error("server rejected message with error {0}")]
    MessageRejected(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Server acknowledgement of a sent message.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResponse {
    pub id: MessageID,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Consecutive unanswered keepalives after which the connection counts as lost.
const MAX_KEEPALIVE_FAILURES: u32 = 3;

/// Event handler type.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// How one connection ended.
#[derive(Debug, PartialEq)]
enum ConnectionEnd {
    Requested,
    /// Server asked for a fresh connection, e.g. after pairing
    Restart,
    LoggedOut,
    Lost(String),
    Fatal,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// WhatsApp client for connecting and messaging.
pub struct Client {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    device: RwLock<Device>,
    store: Arc<dyn DeviceStore>,
    requests: RequestTracker,
    handlers: RwLock<Vec<EventHandler>>,
    /// Frames for the writer task of the current connection
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    logged_in: AtomicBool,
    stop: watch::Sender<bool>,
    /// Resolves to true when the supervisor stopped on request
    supervisor: Mutex<Option<JoinHandle<bool>>>,
    qr_tx: Mutex<Option<mpsc::Sender<QREvent>>>,
    /// Task emitting codes for the current pairing refs
    qr_task: Mutex<Option<JoinHandle<()>>>,
    pair_done: Notify,
    media_conn: tokio::sync::Mutex<Option<MediaConn>>,
}

impl Client {
    pub fn new(config: ClientConfig, device: Device, store: Arc<dyn DeviceStore>) -> Self {
        let (stop, _) = watch::channel(false);
        let dialer = Arc::new(NoiseDialer {
            url: config.endpoint.clone(),
            origin: config.origin.clone(),
            timeout: config.request_timeout,
        });
        Self {
            config,
            dialer,
            device: RwLock::new(device),
            store,
            requests: RequestTracker::new(),
            handlers: RwLock::new(Vec::new()),
            outgoing: Mutex::new(None),
            logged_in: AtomicBool::new(false),
            stop,
            supervisor: Mutex::new(None),
            qr_tx: Mutex::new(None),
            qr_task: Mutex::new(None),
            pair_done: Notify::new(),
            media_conn: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the websocket dialer, e.g. with an in-memory transport.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Register a callback for every emitted event.
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    fn dispatch(&self, event: Event) {
        debug!("Dispatching {} event", event.name());
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Snapshot of the current device.
    pub fn device(&self) -> Device {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn jid(&self) -> Option<JID> {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id
            .clone()
    }

    /// Whether the device is paired.
    pub fn is_logged_in(&self) -> bool {
        self.jid().is_some()
    }

    /// Whether the server accepted the current connection.
    pub fn is_connected(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        lock(&self.supervisor)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Channel of pairing events. Must be called before `connect` on an unpaired device.
    pub fn get_qr_channel(&self) -> Result<QRChannel, ClientError> {
        if self.is_logged_in() {
            return Err(ClientError::AlreadyLoggedIn);
        }
        if self.is_running() {
            return Err(ClientError::AlreadyConnected);
        }
        let (tx, rx) = mpsc::channel(8);
        *lock(&self.qr_tx) = Some(tx);
        Ok(rx)
    }

    /// Dial, handshake and start the connection supervisor.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_running() {
            return Err(ClientError::AlreadyConnected);
        }
        let connection = self.open_connection().await?;
        self.stop.send_replace(false);
        let handle = tokio::spawn(Arc::clone(self).supervise(connection));
        *lock(&self.supervisor) = Some(handle);
        Ok(())
    }

    /// Stop the supervisor and close the socket.
    pub async fn disconnect(&self) {
        self.shutdown(DisconnectReason::Requested).await;
    }

    async fn shutdown(&self, reason: DisconnectReason) {
        let handle = lock(&self.supervisor).take();
        self.stop.send_replace(true);
        let Some(handle) = handle else {
            return;
        };
        match handle.await {
            Ok(true) => self.dispatch(Event::Disconnected(Disconnected { reason })),
            Ok(false) => debug!("Connection supervisor had already stopped"),
            Err(e) => warn!("Connection supervisor ended abnormally: {e}"),
        }
    }

    async fn open_connection(&self) -> Result<Connection, ClientError> {
        let device = self.device();
        info!(
            "Connecting to {} as {}",
            self.config.endpoint,
            device.id.as_ref().map_or("new device".to_string(), JID::to_string)
        );
        Ok(self.dialer.dial(&device).await?)
    }

    /// Sleep unless a disconnect is requested first. Returns false on stop.
    async fn wait_or_stop(&self, duration: Duration) -> bool {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return false;
        }
        tokio::select! {
            _ = sleep(duration) => !*stop.borrow(),
            _ = stop.changed() => false,
        }
    }

    async fn supervise(self: Arc<Self>, connection: Connection) -> bool {
        let stopped = self.keep_connected(connection).await;
        self.end_pairing();
        stopped
    }

    /// Run connections until one ends for good. Returns true if a stop was requested.
    async fn keep_connected(self: &Arc<Self>, mut connection: Connection) -> bool {
        loop {
            let end = self.run_connection(connection).await;
            self.logged_in.store(false, Ordering::SeqCst);
            self.requests.cancel_all();
            // refs of a closed connection can no longer be scanned
            self.stop_qr_codes();
            debug!("Connection ended: {end:?}");

            match end {
                ConnectionEnd::Requested => return true,
                ConnectionEnd::LoggedOut | ConnectionEnd::Fatal => return false,
                ConnectionEnd::Restart => info!("Server requested a reconnect"),
                ConnectionEnd::Lost(reason) => {
                    warn!("Connection lost: {reason}");
                    self.dispatch(Event::Disconnected(Disconnected {
                        reason: DisconnectReason::ConnectionLost(reason),
                    }));
                    if !self.config.auto_reconnect {
                        return false;
                    }
                    if !self.wait_or_stop(self.config.reconnect_delay).await {
                        return true;
                    }
                }
            }

            connection = loop {
                if *self.stop.borrow() {
                    return true;
                }
                match self.open_connection().await {
                    Ok(connection) => break connection,
                    Err(e) => {
                        error!("Failed to reconnect: {e}");
                        if !self.wait_or_stop(self.config.reconnect_delay).await {
                            return true;
                        }
                    }
                }
            };
        }
    }

    async fn run_connection(self: &Arc<Self>, connection: Connection) -> ConnectionEnd {
        let Connection { mut writer, mut reader } = connection;
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *lock(&self.outgoing) = Some(tx);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.send(&frame).await {
                    warn!("Failed to write frame: {e}");
                    break;
                }
            }
            writer.close().await;
        });

        let mut stop = self.stop.subscribe();
        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        let (ping_done, mut ping_results) = mpsc::channel::<bool>(1);
        let mut ping_in_flight = false;
        let mut ping_failures = 0u32;

        let end = loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break ConnectionEnd::Requested;
                    }
                }
                _ = keepalive.tick() => {
                    if ping_in_flight {
                        debug!("Previous keepalive still unanswered, skipping");
                    } else {
                        ping_in_flight = true;
                        let client = Arc::clone(self);
                        let done = ping_done.clone();
                        tokio::spawn(async move {
                            let _ = done.send(client.send_keepalive().await).await;
                        });
                    }
                }
                Some(answered) = ping_results.recv() => {
                    ping_in_flight = false;
                    if answered {
                        ping_failures = 0;
                    } else {
                        ping_failures += 1;
                        if ping_failures >= MAX_KEEPALIVE_FAILURES {
                            break ConnectionEnd::Lost(format!("{ping_failures} keepalives went unanswered"));
                        }
                    }
                }
                frame = reader.recv() => match frame {
                    Ok(data) => match unmarshal(&data) {
                        Ok(node) => {
                            if let Some(end) = self.handle_node(node) {
                                break end;
                            }
                        }
                        Err(e) => warn!("Failed to decode frame: {e}"),
                    },
                    Err(e) => break ConnectionEnd::Lost(e.to_string()),
                },
            }
        };

        lock(&self.outgoing).take();
        if let Err(e) = writer_task.await {
            warn!("Writer task failed: {e}");
        }
        end
    }

    /// Ping the server. Any answer, even an IQ error, shows the link is alive.
    async fn send_keepalive(&self) -> bool {
        let ping = build_iq("get", "w:p", &SERVER_JID, vec![Node::new("ping")]);
        match self.send_iq_within(ping, self.config.keepalive_timeout).await {
            Ok(_) | Err(ClientError::Iq { .. }) => true,
            Err(e) => {
                warn!("Keepalive failed: {e}");
                false
            }
        }
    }

    /// Queue a stanza on the current connection.
    pub fn send_node(&self, node: Node) -> Result<(), ClientError> {
        debug!("--> {node}");
        let frame = marshal(&node);
        match lock(&self.outgoing).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Send `node` and wait for the stanza answering it under the same id.
    async fn round_trip(&self, id: &str, node: Node, wait: Duration) -> Result<Node, ClientError> {
        let rx = self.requests.register(id);
        if let Err(e) = self.send_node(node) {
            self.requests.cancel(id);
            return Err(e);
        }
        match timeout(wait, rx).await {
            Err(_) => {
                self.requests.cancel(id);
                Err(ClientError::Timeout)
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// Send an IQ, assigning its id, and wait for the result.
    pub async fn send_iq(&self, node: Node) -> Result<Node, ClientError> {
        self.send_iq_within(node, self.config.request_timeout).await
    }

    async fn send_iq_within(&self, mut node: Node, wait: Duration) -> Result<Node, ClientError> {
        let id = self.requests.next_id();
        node.set_attr("id", id.as_str());
        let response = self.round_trip(&id, node, wait).await?;
        match iq_error(&response) {
            Some((code, text)) => Err(ClientError::Iq { code, text }),
            None => Ok(response),
        }
    }

    /// Send a message and wait for the server ack.
    pub async fn send_message(&self, to: &JID, message: proto::Message) -> Result<SendResponse, ClientError> {
        if !self.is_logged_in() {
            return Err(ClientError::NotLoggedIn);
        }
        let id = generate_message_id();
        let node = build_message_node(&id, to, &message);
        debug!("Sending {} message {id} to {to}", message.kind());

        let ack = self.round_trip(&id, node, self.config.request_timeout).await?;
        if let Some(code) = ack.get_attr_str("error") {
            return Err(ClientError::MessageRejected(code.to_string()));
        }
        let timestamp = ack
            .get_attr_int("t")
            .map(unix_time)
            .unwrap_or_else(Utc::now);
        Ok(SendResponse { id, timestamp })
    }

    async fn media_conn(&self) -> Result<MediaConn, ClientError> {
        let mut cached = self.media_conn.lock().await;
        if let Some(conn) = cached.as_ref().filter(|c| !c.is_expired()) {
            return Ok(conn.clone());
        }
        let iq = build_iq("set", "w:m", &SERVER_JID, vec![Node::new("media_conn")]);
        let conn = MediaConn::from_node(&self.send_iq(iq).await?)?;
        debug!("Fetched media conn with {} hosts", conn.hosts.len());
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Download and decrypt a media file.
    pub async fn download(&self, media: &MediaDownload) -> Result<Vec<u8>, ClientError> {
        let hosts = match media.direct_path {
            Some(_) => self.media_conn().await?.hosts,
            None => Vec::new(),
        };
        let urls = media.urls(&hosts);
        if urls.is_empty() {
            return Err(TransferError::NoUrl.into());
        }

        let mut last_error = None;
        for url in urls {
            debug!("Downloading media from {url}");
            match tokio::task::spawn_blocking(move || http_download(&url)).await? {
                Ok(data) => {
                    return Ok(decrypt_media(
                        &data,
                        &media.media_key,
                        media.media_type,
                        media.file_enc_sha256.as_deref(),
                        media.file_sha256.as_deref(),
                    )?);
                }
                Err(e) => {
                    warn!("Media download failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(TransferError::NoHosts).into())
    }

    /// Encrypt and upload a media file.
    pub async fn upload(&self, data: Vec<u8>, media_type: MediaType) -> Result<UploadResponse, ClientError> {
        let conn = self.media_conn().await?;
        if conn.hosts.is_empty() {
            return Err(TransferError::NoHosts.into());
        }
        let encrypted = tokio::task::spawn_blocking(move || encrypt_media(&data, media_type)).await?;

        let mut last_error = None;
        for host in conn.hosts {
            let auth = conn.auth.clone();
            let encrypted = encrypted.clone();
            debug!("Uploading {} bytes to {host}", encrypted.data.len());
            match tokio::task::spawn_blocking(move || http_upload(&host, &auth, media_type, encrypted)).await? {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("Media upload failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(TransferError::NoHosts).into())
    }

    /// Handle one incoming stanza. Returns how the connection ends, if it does.
    fn handle_node(self: &Arc<Self>, node: Node) -> Option<ConnectionEnd> {
        debug!("<-- {node}");
        match node.tag.as_str() {
            "success" => {
                info!("Successfully authenticated");
                self.logged_in.store(true, Ordering::SeqCst);
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    let active = build_iq("set", "passive", &SERVER_JID, vec![Node::new("active")]);
                    if let Err(e) = client.send_iq(active).await {
                        warn!("Failed to set passive mode: {e}");
                    }
                });
                if let Some(name) = self.config.push_name.as_deref().filter(|n| !n.is_empty()) {
                    self.send_quietly(
                        Node::new("presence")
                            .with_attr("type", "available")
                            .with_attr("name", name),
                    );
                }
                self.dispatch(Event::Connected(Connected));
                None
            }
            "failure" => Some(self.handle_failure(&node)),
            "stream:error" => Some(self.handle_stream_error(node)),
            "xmlstreamend" => Some(ConnectionEnd::Lost("stream end".to_string())),
            "iq" => {
                self.handle_iq(node);
                None
            }
            "ack" => {
                if let Some(id) = node.get_attr_str("id").map(String::from) {
                    self.requests.complete(&id, node);
                }
                None
            }
            "message" => {
                match parse_message(&node, self.jid().as_ref()) {
                    Ok(event) => self.dispatch(event),
                    Err(e) => warn!("Failed to parse message: {e}"),
                }
                if let Some(receipt) = build_receipt(&node) {
                    self.send_quietly(receipt);
                }
                None
            }
            "receipt" => {
                match parse_receipt(&node) {
                    Ok(receipt) => self.dispatch(Event::Receipt(receipt)),
                    Err(e) => warn!("Failed to parse receipt: {e}"),
                }
                self.send_quietly(build_ack(&node));
                None
            }
            "notification" => {
                self.send_quietly(build_ack(&node));
                None
            }
            other => {
                debug!("Ignoring <{other}> stanza");
                None
            }
        }
    }

    fn send_quietly(&self, node: Node) {
        if let Err(e) = self.send_node(node) {
            warn!("Failed to send stanza: {e}");
        }
    }

    fn handle_failure(&self, node: &Node) -> ConnectionEnd {
        let reason = node.get_attr_str("reason").unwrap_or_default().to_string();
        if reason == "401" {
            warn!("Session was logged out");
            if let Some(jid) = self.jid() {
                if let Err(e) = self.store.delete_device(&jid) {
                    error!("Failed to delete logged out device: {e}");
                }
            }
            self.dispatch(Event::LoggedOut(LoggedOut {
                on_connect: true,
                reason,
            }));
            ConnectionEnd::LoggedOut
        } else {
            error!("Server rejected connection: reason {reason}");
            self.dispatch(Event::Disconnected(Disconnected {
                reason: DisconnectReason::ServerFailure(reason),
            }));
            ConnectionEnd::Fatal
        }
    }

    fn handle_stream_error(&self, node: Node) -> ConnectionEnd {
        let code = node.get_attr_str("code").unwrap_or_default().to_string();
        if code == "515" {
            return ConnectionEnd::Restart;
        }
        error!("Stream error {code}: {node}");
        self.dispatch(Event::StreamError(StreamError { code, raw: node }));
        ConnectionEnd::Fatal
    }

    fn handle_iq(self: &Arc<Self>, node: Node) {
        match node.get_attr_str("type") {
            Some("result") | Some("error") => {
                if let Some(id) = node.get_attr_str("id").map(String::from) {
                    if !self.requests.complete(&id, node) {
                        debug!("No waiter for IQ {id}");
                    }
                }
            }
            _ => {
                if node.get_child_by_tag("pair-device").is_some() {
                    self.handle_pair_device(&node);
                } else if node.get_child_by_tag("pair-success").is_some() {
                    self.handle_pair_success(&node);
                } else if node.get_attr_str("xmlns") == Some("urn:xmpp:ping") {
                    self.send_quietly(build_iq_result(&node));
                } else {
                    debug!("Unhandled IQ: {node}");
                }
            }
        }
    }

    fn qr_event(&self, event: QREvent) {
        if let Some(tx) = lock(&self.qr_tx).as_ref() {
            if tx.try_send(event).is_err() {
                warn!("QR channel is full or closed");
            }
        }
    }

    fn handle_pair_device(self: &Arc<Self>, node: &Node) {
        self.send_quietly(build_iq_result(node));
        let Some(pair_device) = node.get_child_by_tag("pair-device") else {
            return;
        };
        let refs = QRPairing::refs_from_node(pair_device);
        let pairing = QRPairing::from_refs(&refs, &self.device());
        info!("Received {} pairing refs", pairing.len());
        self.stop_qr_codes();
        let task = tokio::spawn(Arc::clone(self).emit_qr_codes(pairing));
        *lock(&self.qr_task) = Some(task);
    }

    /// Stop emitting codes for the current pairing refs.
    fn stop_qr_codes(&self) {
        if let Some(task) = lock(&self.qr_task).take() {
            task.abort();
        }
    }

    /// Close the QR channel once the supervisor is gone and pairing cannot finish.
    fn end_pairing(&self) {
        self.stop_qr_codes();
        if let Some(tx) = lock(&self.qr_tx).take() {
            let _ = tx.try_send(QREvent::Error("connection closed before pairing completed".into()));
        }
    }

    async fn emit_qr_codes(self: Arc<Self>, pairing: QRPairing) {
        let tx = lock(&self.qr_tx).clone();
        let Some(tx) = tx else {
            warn!("Got pairing refs but no QR channel was requested");
            return;
        };
        for (code, timeout) in pairing.codes() {
            let event = QREvent::Code {
                code: code.to_string(),
                timeout,
            };
            if tx.send(event).await.is_err() {
                return;
            }
            tokio::select! {
                _ = sleep(timeout) => {}
                _ = tx.closed() => return,
                _ = self.pair_done.notified() => return,
            }
            if self.is_logged_in() {
                return;
            }
        }
        let _ = tx.send(QREvent::Timeout).await;
        drop(tx);
        lock(&self.qr_tx).take();
        // detach so the supervisor does not abort this task while it shuts down
        lock(&self.qr_task).take();
        self.shutdown(DisconnectReason::PairingTimeout).await;
    }

    fn handle_pair_success(self: &Arc<Self>, node: &Node) {
        let Some(pair_success) = node.get_child_by_tag("pair-success") else {
            return;
        };
        let adv_secret = self.device().adv_secret_key;

        let info = match verify_pair_success(pair_success, &adv_secret) {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to verify pairing: {e}");
                self.send_quietly(build_iq_error(node, 401, "not-authorized"));
                self.qr_event(QREvent::Error(e.to_string()));
                return;
            }
        };

        let device = {
            let mut device = self.device.write().unwrap_or_else(PoisonError::into_inner);
            device.id = Some(info.jid.clone());
            device.business_name = info.business_name.clone();
            device.platform = info.platform.clone();
            device.clone()
        };
        if let Err(e) = self.store.put_device(&device) {
            error!("Failed to save paired device: {e}");
            self.send_quietly(build_iq_error(node, 500, "internal-error"));
            self.qr_event(QREvent::Error(e.to_string()));
            return;
        }

        info!("Paired as {} on {}", info.jid, info.platform);
        self.send_quietly(build_iq_result(node));
        self.qr_event(QREvent::Success);
        lock(&self.qr_tx).take();
        self.pair_done.notify_waiters();
        self.dispatch(Event::PairSuccess(PairSuccess {
            id: info.jid,
            business_name: info.business_name,
            platform: info.platform,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::AdvSignedDeviceIdentityHmac;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use hmac::{Hmac, Mac};
    use prost::Message as ProstMessage;
    use sha2::Sha256;

    fn client_with(device: Device) -> (Arc<Client>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(Client::new(ClientConfig::default(), device, store.clone()));
        (client, store)
    }

    fn paired_device() -> Device {
        let mut device = Device::generate();
        device.id = Some("15559999999:3@s.whatsapp.net".parse().unwrap());
        device
    }

    /// Attach a fake connection and return what the client writes to it.
    fn attach(client: &Client) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&client.outgoing) = Some(tx);
        rx
    }

    struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl FrameWriter for ChannelWriter {
        async fn send(&mut self, frame: &[u8]) -> Result<(), SocketError> {
            self.0
                .send(frame.to_vec())
                .map_err(|_| SocketError::Closed("peer gone".into()))
        }

        async fn close(&mut self) {}
    }

    struct ChannelReader(mpsc::UnboundedReceiver<Vec<u8>>);

    #[async_trait]
    impl FrameReader for ChannelReader {
        async fn recv(&mut self) -> Result<Vec<u8>, SocketError> {
            self.0
                .recv()
                .await
                .ok_or_else(|| SocketError::Closed("peer gone".into()))
        }
    }

    /// Server end of one in-memory connection. Dropping it closes the connection.
    struct Peer {
        from_client: mpsc::UnboundedReceiver<Vec<u8>>,
        to_client: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl Peer {
        fn send(&self, node: &Node) {
            self.to_client.send(marshal(node)).unwrap();
        }

        fn received(&mut self) -> Vec<Node> {
            let mut nodes = Vec::new();
            while let Ok(frame) = self.from_client.try_recv() {
                nodes.push(unmarshal(&frame).unwrap());
            }
            nodes
        }
    }

    /// Hands the server end of every dialed connection to the test.
    struct PeerDialer(mpsc::UnboundedSender<Peer>);

    #[async_trait]
    impl Dialer for PeerDialer {
        async fn dial(&self, _device: &Device) -> Result<Connection, HandshakeError> {
            let (client_tx, from_client) = mpsc::unbounded_channel();
            let (to_client, client_rx) = mpsc::unbounded_channel();
            self.0
                .send(Peer { from_client, to_client })
                .map_err(|_| HandshakeError::Timeout)?;
            Ok(Connection {
                writer: Box::new(ChannelWriter(client_tx)),
                reader: Box::new(ChannelReader(client_rx)),
            })
        }
    }

    fn client_over_peers(config: ClientConfig, device: Device) -> (Arc<Client>, mpsc::UnboundedReceiver<Peer>) {
        let (tx, peers) = mpsc::unbounded_channel();
        let client = Client::new(config, device, Arc::new(MemoryStore::new()))
            .with_dialer(Arc::new(PeerDialer(tx)));
        (Arc::new(client), peers)
    }

    /// Keepalives far apart so they stay out of the way.
    fn quiet_config() -> ClientConfig {
        ClientConfig {
            keepalive_interval: Duration::from_secs(3600),
            ..ClientConfig::default()
        }
    }

    async fn until(what: &str, check: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting until {what}");
    }

    fn disconnects(events: &Mutex<Vec<Event>>) -> Vec<DisconnectReason> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Disconnected(d) => Some(d.reason.clone()),
                _ => None,
            })
            .collect()
    }

    fn pair_device_iq(refs: &[&str]) -> Node {
        Node::new("iq")
            .with_attr("id", "pd1")
            .with_attr("type", "set")
            .with_children(vec![Node::new("pair-device").with_children(
                refs.iter()
                    .map(|r| Node::new("ref").with_bytes(r.as_bytes().to_vec()))
                    .collect(),
            )])
    }

    fn recorded_events(client: &Client) -> Arc<Mutex<Vec<Event>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client.add_event_handler(move |evt| sink.lock().unwrap().push(evt));
        events
    }

    #[tokio::test]
    async fn send_requires_login_and_connection() {
        let (client, _) = client_with(Device::generate());
        let err = client.send_message(&SERVER_JID, proto::Message::text("hi")).await;
        assert!(matches!(err, Err(ClientError::NotLoggedIn)));

        let (client, _) = client_with(paired_device());
        let err = client.send_message(&SERVER_JID, proto::Message::text("hi")).await;
        assert!(matches!(err, Err(ClientError::NotConnected)));
        assert_eq!(client.requests.pending_count(), 0);
    }

    #[tokio::test]
    async fn qr_channel_only_for_unpaired_device() {
        let (client, _) = client_with(paired_device());
        assert!(matches!(client.get_qr_channel(), Err(ClientError::AlreadyLoggedIn)));

        let (client, _) = client_with(Device::generate());
        assert!(client.get_qr_channel().is_ok());
    }

    #[tokio::test]
    async fn send_message_resolves_on_ack() {
        let (client, _) = client_with(paired_device());
        let mut frames = attach(&client);

        let sender = Arc::clone(&client);
        let task = tokio::spawn(async move {
            sender
                .send_message(&"15550001111@s.whatsapp.net".parse().unwrap(), proto::Message::text("pong"))
                .await
        });

        let sent = unmarshal(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(sent.tag, "message");
        let id = sent.get_attr_str("id").unwrap().to_string();

        let ack = Node::new("ack")
            .with_attr("id", id.as_str())
            .with_attr("class", "message")
            .with_attr("t", "1700000000");
        assert_eq!(client.handle_node(ack), None);

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.timestamp.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn iq_error_maps_to_client_error() {
        let (client, _) = client_with(paired_device());
        let mut frames = attach(&client);

        let sender = Arc::clone(&client);
        let task = tokio::spawn(async move {
            sender
                .send_iq(build_iq("set", "w:m", &SERVER_JID, vec![Node::new("media_conn")]))
                .await
        });

        let sent = unmarshal(&frames.recv().await.unwrap()).unwrap();
        let reply = build_iq_error(&sent, 404, "item-not-found");
        client.handle_node(reply);

        match task.await.unwrap() {
            Err(ClientError::Iq { code, text }) => {
                assert_eq!(code, 404);
                assert_eq!(text, "item-not-found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn incoming_message_is_dispatched_and_receipted() {
        let (client, _) = client_with(paired_device());
        let mut frames = attach(&client);
        let events = recorded_events(&client);

        let node = Node::new("message")
            .with_attr("id", "3EB0FF")
            .with_attr("from", JID::new("15550001111", "s.whatsapp.net"))
            .with_attr("type", "text")
            .with_children(vec![Node::new("plaintext")
                .with_bytes(proto::Message::text("ping").encode_to_vec())]);
        assert_eq!(client.handle_node(node), None);

        let events = events.lock().unwrap();
        assert!(matches!(&events[0], Event::Message(m) if m.message.conversation.as_deref() == Some("ping")));

        let receipt = unmarshal(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(receipt.tag, "receipt");
        assert_eq!(receipt.get_attr_str("id"), Some("3EB0FF"));
    }

    #[tokio::test]
    async fn server_ping_gets_result() {
        let (client, _) = client_with(paired_device());
        let mut frames = attach(&client);

        let ping = Node::new("iq")
            .with_attr("id", "p1")
            .with_attr("type", "get")
            .with_attr("xmlns", "urn:xmpp:ping")
            .with_attr("from", SERVER_JID.clone());
        client.handle_node(ping);

        let result = unmarshal(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(result.get_attr_str("type"), Some("result"));
        assert_eq!(result.get_attr_str("id"), Some("p1"));
    }

    #[tokio::test]
    async fn success_marks_connected_and_announces_presence() {
        let store = Arc::new(MemoryStore::new());
        let config = ClientConfig {
            push_name: Some("Bot".to_string()),
            ..ClientConfig::default()
        };
        let client = Arc::new(Client::new(config, paired_device(), store));
        let mut frames = attach(&client);
        let events = recorded_events(&client);

        assert_eq!(client.handle_node(Node::new("success")), None);
        assert!(client.is_connected());
        assert!(matches!(&events.lock().unwrap()[0], Event::Connected(_)));

        let presence = unmarshal(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(presence.tag, "presence");
        assert_eq!(presence.get_attr_str("name"), Some("Bot"));
    }

    #[tokio::test]
    async fn stream_errors_end_connection() {
        let (client, _) = client_with(paired_device());
        let events = recorded_events(&client);

        let restart = Node::new("stream:error").with_attr("code", "515");
        assert_eq!(client.handle_node(restart), Some(ConnectionEnd::Restart));
        assert!(events.lock().unwrap().is_empty());

        let conflict = Node::new("stream:error").with_attr("code", "409");
        assert_eq!(client.handle_node(conflict), Some(ConnectionEnd::Fatal));
        assert!(matches!(&events.lock().unwrap()[0], Event::StreamError(e) if e.code == "409"));
    }

    #[tokio::test]
    async fn logout_failure_deletes_device() {
        let device = paired_device();
        let (client, store) = client_with(device.clone());
        store.put_device(&device).unwrap();
        let events = recorded_events(&client);

        let failure = Node::new("failure").with_attr("reason", "401");
        assert_eq!(client.handle_node(failure), Some(ConnectionEnd::LoggedOut));
        assert!(store.get_first_device().unwrap().is_none());
        assert!(matches!(&events.lock().unwrap()[0], Event::LoggedOut(_)));
    }

    #[tokio::test]
    async fn pair_success_stores_device_and_reports() {
        let (client, store) = client_with(Device::generate());
        let mut qr = client.get_qr_channel().unwrap();
        let mut frames = attach(&client);
        let events = recorded_events(&client);

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&client.device().adv_secret_key).unwrap();
        mac.update(b"details");
        let identity = AdvSignedDeviceIdentityHmac {
            details: Some(b"details".to_vec()),
            hmac: Some(mac.finalize().into_bytes().to_vec()),
        };
        let iq = Node::new("iq")
            .with_attr("id", "ps1")
            .with_attr("type", "set")
            .with_attr("from", SERVER_JID.clone())
            .with_children(vec![Node::new("pair-success").with_children(vec![
                Node::new("device-identity").with_bytes(identity.encode_to_vec()),
                Node::new("device").with_attr("jid", JID::new_ad("15550001111", 0, 9)),
                Node::new("platform").with_attr("name", "android"),
            ])]);
        client.handle_node(iq);

        assert_eq!(qr.recv().await, Some(QREvent::Success));
        assert_eq!(client.jid().unwrap().device, 9);
        assert_eq!(store.get_first_device().unwrap().unwrap().platform, "android");
        assert!(matches!(&events.lock().unwrap()[0], Event::PairSuccess(p) if p.id.user == "15550001111"));

        let answer = unmarshal(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(answer.get_attr_str("type"), Some("result"));
    }

    #[tokio::test]
    async fn pair_success_with_bad_hmac_is_rejected() {
        let (client, store) = client_with(Device::generate());
        let mut qr = client.get_qr_channel().unwrap();
        let mut frames = attach(&client);

        let identity = AdvSignedDeviceIdentityHmac {
            details: Some(b"details".to_vec()),
            hmac: Some(vec![0; 32]),
        };
        let iq = Node::new("iq")
            .with_attr("id", "ps2")
            .with_attr("type", "set")
            .with_children(vec![Node::new("pair-success").with_children(vec![
                Node::new("device-identity").with_bytes(identity.encode_to_vec()),
                Node::new("device").with_attr("jid", JID::new_ad("15550001111", 0, 9)),
            ])]);
        client.handle_node(iq);

        assert!(matches!(qr.recv().await, Some(QREvent::Error(_))));
        assert!(!client.is_logged_in());
        assert!(store.get_first_device().unwrap().is_none());

        let answer = unmarshal(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(answer.get_attr_str("type"), Some("error"));
    }

    #[tokio::test]
    async fn pair_device_emits_first_code() {
        let (client, _) = client_with(Device::generate());
        let mut qr = client.get_qr_channel().unwrap();
        let _frames = attach(&client);

        client.handle_node(pair_device_iq(&["2@ref"]));

        match qr.recv().await {
            Some(QREvent::Code { code, timeout }) => {
                assert!(code.starts_with("2@ref,"));
                assert_eq!(timeout, Duration::from_secs(60));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn qr_codes_run_out_then_time_out() {
        let (client, _) = client_with(Device::generate());
        let mut qr = client.get_qr_channel().unwrap();
        let _frames = attach(&client);

        client.handle_node(pair_device_iq(&["2@first", "2@second"]));

        let mut codes = Vec::new();
        for _ in 0..2 {
            match qr.recv().await {
                Some(QREvent::Code { code, timeout }) => codes.push((code, timeout)),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(codes[0].0.starts_with("2@first,"));
        assert_eq!(codes[0].1, Duration::from_secs(60));
        assert!(codes[1].0.starts_with("2@second,"));
        assert_eq!(codes[1].1, Duration::from_secs(20));

        assert_eq!(qr.recv().await, Some(QREvent::Timeout));
        assert_eq!(qr.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_is_redialed() {
        let config = ClientConfig {
            reconnect_delay: Duration::from_secs(1),
            ..quiet_config()
        };
        let (client, mut peers) = client_over_peers(config, paired_device());
        let events = recorded_events(&client);

        client.connect().await.unwrap();
        let first = peers.recv().await.unwrap();
        first.send(&Node::new("success"));
        until("connected", || client.is_connected()).await;

        drop(first);
        let second = peers.recv().await.unwrap();
        assert!(!client.is_connected());
        second.send(&Node::new("success"));
        until("reconnected", || client.is_connected()).await;
        assert!(matches!(
            disconnects(&events).as_slice(),
            [DisconnectReason::ConnectionLost(_)]
        ));

        client.disconnect().await;
        assert!(!client.is_running());
        assert!(matches!(
            disconnects(&events).as_slice(),
            [DisconnectReason::ConnectionLost(_), DisconnectReason::Requested]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_without_auto_reconnect_stops() {
        let config = ClientConfig {
            auto_reconnect: false,
            ..quiet_config()
        };
        let (client, mut peers) = client_over_peers(config, paired_device());
        let events = recorded_events(&client);

        client.connect().await.unwrap();
        drop(peers.recv().await.unwrap());
        until("supervisor stopped", || !client.is_running()).await;

        sleep(Duration::from_secs(30)).await;
        assert!(peers.try_recv().is_err());

        // the loss was already reported; disconnecting adds nothing
        client.disconnect().await;
        assert!(matches!(
            disconnects(&events).as_slice(),
            [DisconnectReason::ConnectionLost(_)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_reports_once() {
        let (client, mut peers) = client_over_peers(quiet_config(), paired_device());
        let events = recorded_events(&client);

        client.connect().await.unwrap();
        let _peer = peers.recv().await.unwrap();
        client.disconnect().await;
        client.disconnect().await;

        assert_eq!(disconnects(&events), vec![DisconnectReason::Requested]);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_keepalives_end_connection() {
        let config = ClientConfig {
            keepalive_interval: Duration::from_secs(25),
            keepalive_timeout: Duration::from_secs(60),
            auto_reconnect: false,
            ..ClientConfig::default()
        };
        let (client, mut peers) = client_over_peers(config, paired_device());
        let events = recorded_events(&client);

        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        until("keepalives gave up", || !client.is_running()).await;

        match disconnects(&events).as_slice() {
            [DisconnectReason::ConnectionLost(reason)] => assert!(reason.contains("keepalive")),
            other => panic!("unexpected {other:?}"),
        }
        let pings = peer
            .received()
            .into_iter()
            .filter(|node| node.get_child_by_tag("ping").is_some())
            .count();
        assert_eq!(pings, MAX_KEEPALIVE_FAILURES as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_keepalives_keep_connection() {
        let config = ClientConfig {
            keepalive_interval: Duration::from_secs(25),
            auto_reconnect: false,
            ..ClientConfig::default()
        };
        let (client, mut peers) = client_over_peers(config, paired_device());
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let mut answered = 0;
        while answered < 5 {
            let frame = peer.from_client.recv().await.unwrap();
            let ping = unmarshal(&frame).unwrap();
            assert!(ping.get_child_by_tag("ping").is_some());
            peer.send(&build_iq_result(&ping));
            answered += 1;
        }
        assert!(client.is_running());
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn qr_channel_closes_when_connection_ends() {
        let config = ClientConfig {
            auto_reconnect: false,
            ..quiet_config()
        };
        let (client, mut peers) = client_over_peers(config, Device::generate());
        let mut qr = client.get_qr_channel().unwrap();

        client.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();
        peer.send(&pair_device_iq(&["2@first", "2@second"]));
        assert!(matches!(qr.recv().await, Some(QREvent::Code { .. })));

        drop(peer);
        assert!(matches!(qr.recv().await, Some(QREvent::Error(_))));
        assert_eq!(qr.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_drops_stale_qr_codes() {
        let config = ClientConfig {
            reconnect_delay: Duration::from_secs(1),
            ..quiet_config()
        };
        let (client, mut peers) = client_over_peers(config, Device::generate());
        let mut qr = client.get_qr_channel().unwrap();

        client.connect().await.unwrap();
        let first = peers.recv().await.unwrap();
        first.send(&pair_device_iq(&["2@old", "2@older"]));
        assert!(matches!(qr.recv().await, Some(QREvent::Code { code, .. }) if code.starts_with("2@old,")));

        drop(first);
        let second = peers.recv().await.unwrap();
        sleep(Duration::from_secs(120)).await;
        assert!(qr.try_recv().is_err());

        second.send(&pair_device_iq(&["2@new"]));
        assert!(matches!(qr.recv().await, Some(QREvent::Code { code, .. }) if code.starts_with("2@new,")));
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_timeout_disconnects() {
        let (client, mut peers) = client_over_peers(quiet_config(), Device::generate());
        let events = recorded_events(&client);
        let mut qr = client.get_qr_channel().unwrap();

        client.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();
        peer.send(&pair_device_iq(&["2@only"]));

        assert!(matches!(qr.recv().await, Some(QREvent::Code { .. })));
        assert_eq!(qr.recv().await, Some(QREvent::Timeout));
        assert_eq!(qr.recv().await, None);
        until("timeout reported", || !disconnects(&events).is_empty()).await;
        assert!(!client.is_running());
        assert_eq!(disconnects(&events), vec![DisconnectReason::PairingTimeout]);
    }
}
