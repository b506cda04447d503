//! Device state, listening mode and the session aggregate
//!
//! The orchestrator is the only writer of [`Session`]. Everyone else sees
//! copies of it published after each committed change.

use serde::{Deserialize, Serialize};

/// The three states a voice session can be in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Waiting for a wake phrase or a manual command
    #[default]
    Idle,
    /// Capturing user speech
    Listening,
    /// Backend reply is being played back
    Speaking,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Idle => write!(f, "Idle"),
            DeviceState::Listening => write!(f, "Listening"),
            DeviceState::Speaking => write!(f, "Speaking"),
        }
    }
}

/// How the backend decides when the user has finished talking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Push-to-talk, stopped explicitly by the client
    Manual,
    /// Backend stops listening on silence
    #[serde(rename = "auto")]
    AutoStop,
    /// Full duplex, capture continues while the backend speaks
    Realtime,
}

impl ListeningMode {
    /// Mode used for hands-free conversations
    pub fn for_conversation(aec_enabled: bool) -> Self {
        if aec_enabled {
            Self::Realtime
        } else {
            Self::AutoStop
        }
    }

    /// Wire name used in `listen` frames
    pub fn as_str(&self) -> &'static str {
        match self {
            ListeningMode::Manual => "manual",
            ListeningMode::AutoStop => "auto",
            ListeningMode::Realtime => "realtime",
        }
    }
}

impl std::fmt::Display for ListeningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate session state owned by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Current device state
    pub state: DeviceState,
    /// Listening mode for hands-free conversations
    pub mode: ListeningMode,
    /// Re-arm listening after every assistant turn
    pub keep_listening: bool,
    /// Acoustic echo cancellation is available
    pub aec_enabled: bool,
    /// An abort is in progress; capture is suppressed until it settles
    pub aborted: bool,
    /// The audio channel to the backend is open
    pub channel_open: bool,
}

impl Session {
    /// Fresh session in Idle with no channel
    pub fn new(aec_enabled: bool) -> Self {
        Self {
            state: DeviceState::Idle,
            mode: ListeningMode::for_conversation(aec_enabled),
            keep_listening: false,
            aec_enabled,
            aborted: false,
            channel_open: false,
        }
    }

    /// Whether microphone frames should be forwarded right now
    ///
    /// Idle capture with an open channel feeds passive wake-phrase detection.
    /// Capture while speaking is barge-in and needs echo cancellation,
    /// continuous dialogue and realtime mode together.
    pub fn should_capture_audio(&self) -> bool {
        match self.state {
            DeviceState::Listening => !self.aborted,
            DeviceState::Idle => self.channel_open,
            DeviceState::Speaking => {
                self.aec_enabled && self.keep_listening && self.mode == ListeningMode::Realtime
            }
        }
    }
}
