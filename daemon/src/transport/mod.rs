//! Duplex channel to the conversational backend
//!
//! A transport opens and closes the audio channel, sends control and audio
//! frames, and reports what it receives as [`TransportEvent`]s. Events are
//! pushed through a [`TransportSink`] onto the orchestrator's queue, so a
//! transport reading on another task or thread never calls into the
//! orchestrator directly.

mod websocket;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{Protocol, TransportConfig};
use crate::events::AbortReason;
use crate::state::ListeningMode;

pub use websocket::WebsocketTransport;

/// Everything a transport can report back
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection-level failure outside of an open call
    NetworkError(String),
    /// A JSON control event from the backend
    IncomingJson(Value),
    /// An encoded audio frame from the backend
    IncomingAudio(Vec<u8>),
    /// The audio channel finished its handshake
    AudioChannelOpened,
    /// The audio channel went away
    AudioChannelClosed,
}

/// Registration point handed to a transport at bind time
///
/// Each method corresponds to one of the transport callbacks. Delivery is a
/// queue push, never a direct call into the orchestrator.
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx }
    }

    pub fn network_error(&self, message: impl Into<String>) {
        self.push(TransportEvent::NetworkError(message.into()));
    }

    pub fn incoming_json(&self, value: Value) {
        self.push(TransportEvent::IncomingJson(value));
    }

    pub fn incoming_audio(&self, data: Vec<u8>) {
        self.push(TransportEvent::IncomingAudio(data));
    }

    pub fn audio_channel_opened(&self) {
        self.push(TransportEvent::AudioChannelOpened);
    }

    pub fn audio_channel_closed(&self) {
        self.push(TransportEvent::AudioChannelClosed);
    }

    fn push(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            warn!("transport event dropped, orchestrator is gone");
        }
    }
}

/// Errors raised by transport operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("server refused the audio channel")]
    Refused,

    #[error("audio channel is not open")]
    NotOpen,

    #[error("failed to send frame: {0}")]
    Send(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Abstract duplex channel shared by the WebSocket and MQTT variants
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Register where events are delivered; called once before opening
    fn bind(&self, sink: TransportSink);

    /// Open the audio channel; `Ok(false)` is a protocol-level refusal
    async fn open_audio_channel(&self) -> Result<bool, TransportError>;

    async fn close_audio_channel(&self);

    fn is_audio_channel_opened(&self) -> bool;

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<(), TransportError>;

    async fn send_stop_listening(&self) -> Result<(), TransportError>;

    async fn send_abort_speaking(&self, reason: AbortReason) -> Result<(), TransportError>;

    async fn send_wake_word_detected(&self, text: &str) -> Result<(), TransportError>;

    /// Forward one encoded capture frame
    async fn send_audio(&self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Build the transport selected in configuration
pub fn build(config: &TransportConfig) -> anyhow::Result<Arc<dyn Transport>> {
    match config.protocol {
        Protocol::Websocket => Ok(Arc::new(WebsocketTransport::new(config.clone())?)),
    }
}
