//! WebSocket transport
//!
//! Connects with the device identity headers, performs the `hello`
//! handshake and then streams JSON control events and binary audio frames.
//! A reader task owns the receive half and only ever pushes into the
//! [`TransportSink`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Transport, TransportError, TransportSink};
use crate::config::TransportConfig;
use crate::events::{AbortReason, ClientMessage, ServerMessage};
use crate::state::ListeningMode;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

const PROTOCOL_VERSION: u8 = 1;

/// State shared with the reader task
#[derive(Default)]
struct Shared {
    opened: AtomicBool,
    session_id: Mutex<Option<String>>,
    sink: Mutex<Option<TransportSink>>,
}

impl Shared {
    fn sink(&self) -> Option<TransportSink> {
        self.sink.lock().ok().and_then(|s| s.clone())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }
}

pub struct WebsocketTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
    writer: AsyncMutex<Option<WsWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebsocketTransport {
    pub fn new(config: TransportConfig) -> anyhow::Result<Self> {
        if !(config.url.starts_with("ws://") || config.url.starts_with("wss://")) {
            anyhow::bail!("websocket url must start with ws:// or wss://, got {}", config.url);
        }
        Ok(Self {
            config,
            shared: Arc::new(Shared::default()),
            writer: AsyncMutex::new(None),
            reader: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let headers = request.headers_mut();
        if let Some(token) = &self.config.access_token {
            headers.insert("Authorization", header(&format!("Bearer {token}"))?);
        }
        headers.insert("Protocol-Version", header(&PROTOCOL_VERSION.to_string())?);
        headers.insert("Device-Id", header(&self.config.device_id)?);
        headers.insert("Client-Id", header(&self.config.client_id)?);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(stream)
    }

    async fn send_message(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        debug!(%message, "sending control frame");
        self.send_frame(Message::Text(text)).await
    }

    async fn send_frame(&self, frame: Message) -> Result<(), TransportError> {
        if !self.is_audio_channel_opened() {
            return Err(TransportError::NotOpen);
        }
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::NotOpen)?;
        writer
            .send(frame)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Tear down the socket without reporting a close
    async fn discard_connection(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
    }
}

fn header(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|e| TransportError::Connect(e.to_string()))
}

/// Receive loop; the first server `hello` opens the channel
async fn read_loop(
    mut read: SplitStream<WsStream>,
    shared: Arc<Shared>,
    mut hello_tx: Option<oneshot::Sender<()>>,
) {
    while let Some(message) = read.next().await {
        let sink = shared.sink();
        match message {
            Ok(Message::Text(text)) => {
                let value: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(?e, "ignoring malformed JSON frame");
                        continue;
                    }
                };
                if let ServerMessage::Hello { session_id } = ServerMessage::classify(&value) {
                    if let Some(tx) = hello_tx.take() {
                        if tx.is_closed() {
                            break;
                        }
                        info!(?session_id, "audio channel opened");
                        if let Ok(mut slot) = shared.session_id.lock() {
                            *slot = session_id;
                        }
                        // Opened must be reported before anything that follows the hello
                        shared.opened.store(true, Ordering::SeqCst);
                        if let Some(sink) = &sink {
                            sink.audio_channel_opened();
                        }
                        let _ = tx.send(());
                        continue;
                    }
                }
                if let Some(sink) = sink {
                    sink.incoming_json(value);
                }
            }
            Ok(Message::Binary(data)) => {
                if let Some(sink) = sink {
                    sink.incoming_audio(data);
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(sink) = sink {
                    sink.network_error(format!("websocket error: {e}"));
                }
                break;
            }
        }
    }

    if shared.opened.swap(false, Ordering::SeqCst) {
        if let Some(sink) = shared.sink() {
            sink.audio_channel_closed();
        }
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn bind(&self, sink: TransportSink) {
        if let Ok(mut slot) = self.shared.sink.lock() {
            *slot = Some(sink);
        }
    }

    async fn open_audio_channel(&self) -> Result<bool, TransportError> {
        if self.is_audio_channel_opened() {
            return Ok(true);
        }
        self.discard_connection().await;

        info!(url = %self.config.url, "opening audio channel");
        let (write, read) = self.connect().await?.split();
        *self.writer.lock().await = Some(write);

        let (hello_tx, hello_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(read, Arc::clone(&self.shared), Some(hello_tx)));
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(reader);
        }

        let hello = ClientMessage::Hello {
            version: PROTOCOL_VERSION,
            transport: "websocket",
            audio_params: self.config.audio_params,
        };
        let text =
            serde_json::to_string(&hello).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let sent = match self.writer.lock().await.as_mut() {
            Some(writer) => writer.send(Message::Text(text)).await,
            None => return Err(TransportError::NotOpen),
        };
        if let Err(e) = sent {
            self.discard_connection().await;
            return Err(TransportError::Send(e.to_string()));
        }

        match tokio::time::timeout(self.config.hello_timeout, hello_rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => {
                warn!("connection ended before server hello");
                self.discard_connection().await;
                Ok(false)
            }
            Err(_) => {
                warn!("timed out waiting for server hello");
                self.shared.opened.store(false, Ordering::SeqCst);
                self.discard_connection().await;
                Err(TransportError::Timeout)
            }
        }
    }

    async fn close_audio_channel(&self) {
        let was_open = self.shared.opened.swap(false, Ordering::SeqCst);
        self.discard_connection().await;
        if was_open {
            info!("audio channel closed");
            if let Some(sink) = self.shared.sink() {
                sink.audio_channel_closed();
            }
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.shared.opened.load(Ordering::SeqCst)
    }

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<(), TransportError> {
        let message = ClientMessage::start_listening(self.shared.session_id(), mode);
        self.send_message(&message).await
    }

    async fn send_stop_listening(&self) -> Result<(), TransportError> {
        let message = ClientMessage::stop_listening(self.shared.session_id());
        self.send_message(&message).await
    }

    async fn send_abort_speaking(&self, reason: AbortReason) -> Result<(), TransportError> {
        let message = ClientMessage::abort(self.shared.session_id(), reason);
        self.send_message(&message).await
    }

    async fn send_wake_word_detected(&self, text: &str) -> Result<(), TransportError> {
        let message = ClientMessage::wake_word_detected(self.shared.session_id(), text);
        self.send_message(&message).await
    }

    async fn send_audio(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.send_frame(Message::Binary(frame.to_vec())).await
    }
}
