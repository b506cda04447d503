//! Messages exchanged with the conversational backend
//!
//! Inbound JSON events are classified into [`ServerMessage`] while the raw
//! value is kept for forwarding. Outbound control frames are [`ClientMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::ListeningMode;

/// Events received from the backend, keyed by their `type` field
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake reply that opens the audio channel
    Hello {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Backend ended the conversation
    Goodbye,

    /// Speech-to-text result for the user's utterance
    Stt {
        #[serde(default)]
        text: String,
    },

    /// Text-to-speech playback progress
    Tts {
        state: TtsState,
        #[serde(default)]
        text: Option<String>,
    },

    /// Any other type, forwarded untouched
    #[serde(other)]
    Other,
}

impl ServerMessage {
    /// Classify a raw JSON event; malformed known types fall back to `Other`
    pub fn classify(value: &Value) -> Self {
        Self::deserialize(value).unwrap_or(Self::Other)
    }
}

/// Playback phases reported in `tts` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    #[serde(other)]
    Other,
}

/// Why playback is being interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// No specific reason
    None,
    /// A wake phrase was heard while the backend was speaking
    WakeWordDetected,
    /// User asked to stop via a command
    UserInterruption,
}

impl AbortReason {
    /// Value carried in the `reason` field, if any
    fn wire(self) -> Option<&'static str> {
        match self {
            AbortReason::None => None,
            AbortReason::WakeWordDetected => Some("wake_word_detected"),
            AbortReason::UserInterruption => Some("user_interruption"),
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire().unwrap_or("none"))
    }
}

/// Audio stream parameters advertised in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioParams {
    pub format: &'static str,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus",
            sample_rate: 16000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

/// Listen sub-commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// Control frames sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opening handshake
    Hello {
        version: u8,
        transport: &'static str,
        audio_params: AudioParams,
    },

    /// Start, stop, or announce a detected wake phrase
    Listen {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ListeningMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    /// Interrupt the current reply
    Abort {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
}

impl ClientMessage {
    pub fn start_listening(session_id: Option<String>, mode: ListeningMode) -> Self {
        ClientMessage::Listen {
            session_id,
            state: ListenState::Start,
            mode: Some(mode),
            text: None,
        }
    }

    pub fn stop_listening(session_id: Option<String>) -> Self {
        ClientMessage::Listen {
            session_id,
            state: ListenState::Stop,
            mode: None,
            text: None,
        }
    }

    pub fn wake_word_detected(session_id: Option<String>, text: &str) -> Self {
        ClientMessage::Listen {
            session_id,
            state: ListenState::Detect,
            mode: None,
            text: Some(text.to_string()),
        }
    }

    pub fn abort(session_id: Option<String>, reason: AbortReason) -> Self {
        ClientMessage::Abort {
            session_id,
            reason: reason.wire(),
        }
    }
}

impl std::fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientMessage::Hello { transport, .. } => write!(f, "HELLO ({})", transport),
            ClientMessage::Listen { state, mode, .. } => match (state, mode) {
                (ListenState::Start, Some(mode)) => write!(f, "LISTEN_START ({})", mode),
                (ListenState::Start, None) => write!(f, "LISTEN_START"),
                (ListenState::Stop, _) => write!(f, "LISTEN_STOP"),
                (ListenState::Detect, _) => write!(f, "LISTEN_DETECT"),
            },
            ClientMessage::Abort { reason, .. } => {
                write!(f, "ABORT ({})", reason.unwrap_or("none"))
            }
        }
    }
}
