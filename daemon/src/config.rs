//! Configuration loading and management

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::events::AudioParams;

/// Which backend transport to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Websocket,
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::Websocket),
            "mqtt" => bail!("mqtt transport is not available in this build, use websocket"),
            other => bail!("unknown protocol '{other}', expected websocket"),
        }
    }
}

/// How wake phrases are matched against recognized text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Phrase must appear as whole, contiguous tokens
    #[default]
    Token,
    /// Phrase may appear anywhere in the text
    Substring,
}

impl FromStr for MatchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token" => Ok(Self::Token),
            "substring" => Ok(Self::Substring),
            other => bail!("unknown wake match policy '{other}', expected token or substring"),
        }
    }
}

/// Backend connection settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub protocol: Protocol,
    pub url: String,
    pub access_token: Option<String>,
    pub device_id: String,
    pub client_id: String,
    /// How long to wait for the server hello
    pub hello_timeout: Duration,
    pub audio_params: AudioParams,
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Echo cancellation available, enables realtime barge-in
    pub aec_enabled: bool,
    /// Upper bound on one channel-open attempt
    pub connect_timeout: Duration,
    /// Delay before reconnecting after the channel closes
    pub reconnect_delay: Duration,
    /// Pause after entering Listening before capture resumes after an abort
    pub listen_settle: Duration,
    /// Text announced to the backend when a wake phrase starts a conversation
    pub greeting: String,
    /// How long shutdown waits for background work
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aec_enabled: true,
            connect_timeout: Duration::from_secs(12),
            reconnect_delay: Duration::from_secs(1),
            listen_settle: Duration::from_millis(500),
            greeting: "Hello".to_string(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Wake phrase detection settings
#[derive(Debug, Clone)]
pub struct WakeWordConfig {
    pub enabled: bool,
    pub phrases: Vec<String>,
    pub policy: MatchPolicy,
    /// Repeat triggers inside this window are ignored
    pub cooldown: Duration,
    /// Frames buffered between capture and the recognizer
    pub queue_capacity: usize,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            phrases: vec!["hello".to_string()],
            policy: MatchPolicy::Token,
            cooldown: Duration::from_secs(2),
            queue_capacity: 100,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for the control interface
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub wake_word: WakeWordConfig,

    /// Raw PCM stream to capture from, usually a FIFO
    pub capture_source: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let home = lookup("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("murmur");

        let socket_path = lookup("MURMUR_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let protocol = match lookup("MURMUR_PROTOCOL") {
            Some(value) => value.parse()?,
            None => Protocol::Websocket,
        };

        let capture_source = lookup("MURMUR_CAPTURE_SOURCE")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let mut transport = TransportConfig {
            protocol,
            url: lookup("MURMUR_SERVER_URL")
                .unwrap_or_else(|| "ws://127.0.0.1:8000/xiaozhi/v1/".to_string()),
            access_token: lookup("MURMUR_ACCESS_TOKEN").filter(|t| !t.is_empty()),
            device_id: lookup("MURMUR_DEVICE_ID").unwrap_or_else(|| "murmur-device".to_string()),
            client_id: lookup("MURMUR_CLIENT_ID")
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            hello_timeout: Duration::from_secs(10),
            audio_params: AudioParams::default(),
        };
        if capture_source.is_some() {
            // Captured frames go upstream unencoded
            transport.audio_params.format = "pcm";
        }

        let mut session = SessionConfig::default();
        if let Some(value) = lookup("MURMUR_AEC") {
            session.aec_enabled = parse_bool("MURMUR_AEC", &value)?;
        }
        if let Some(greeting) = lookup("MURMUR_GREETING") {
            session.greeting = greeting;
        }

        let mut wake_word = WakeWordConfig::default();
        if let Some(value) = lookup("MURMUR_WAKE_WORD") {
            wake_word.enabled = parse_bool("MURMUR_WAKE_WORD", &value)?;
        }
        if let Some(value) = lookup("MURMUR_WAKE_PHRASES") {
            let phrases: Vec<String> = value
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
            if phrases.is_empty() {
                bail!("MURMUR_WAKE_PHRASES must name at least one phrase");
            }
            wake_word.phrases = phrases;
        }
        if let Some(value) = lookup("MURMUR_WAKE_MATCH") {
            wake_word.policy = value.parse()?;
        }

        Ok(Self {
            socket_path,
            data_dir,
            transport,
            session,
            wake_word,
            capture_source,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key}: expected a boolean, got '{other}'"),
    }
}
