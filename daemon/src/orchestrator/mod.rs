//! Session orchestrator
//!
//! Owns the device state, decides when the audio channel is opened and
//! reopened, and turns transport events and module commands into state
//! transitions. It is the only writer of [`Session`]; modules see published
//! snapshots through their [`SessionHandle`].
//!
//! Everything here runs on one thread of control. Transport callbacks and
//! module commands arrive over queues and are drained by [`Orchestrator::run`].

mod handle;
mod transitions;

#[cfg(test)]
mod tests;

pub use handle::{Command, SessionHandle};

#[cfg(test)]
pub(crate) use handle::testing;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::audio::{CaptureHandle, PlaybackQueue};
use crate::config::{SessionConfig, WakeWordConfig};
use crate::events::{ServerMessage, TtsState};
use crate::lifecycle::TaskSupervisor;
use crate::modules::{CapabilityModule, ModuleRegistry};
use crate::state::{DeviceState, ListeningMode, Session};
use crate::transport::{Transport, TransportError, TransportEvent, TransportSink};
use crate::wake::{WakeDetector, WakePhraseMatcher};

const COMMAND_QUEUE: usize = 32;
const UPLINK_QUEUE: usize = 64;

/// Why the audio channel could not be opened
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("timed out after {0:?} opening the audio channel")]
    Timeout(Duration),

    #[error("server refused the audio channel")]
    Refused,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("orchestrator is already running")]
    AlreadyRunning,

    #[error("session has shut down")]
    Closed,

    #[error("startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Receiving ends drained by the run loop
struct Inbox {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    uplink: mpsc::Receiver<Vec<u8>>,
}

/// Outcome of the last channel-open attempt, shared with callers that waited on it
#[derive(Default)]
struct ConnectGate {
    last: Option<Result<(), ConnectError>>,
}

pub struct Orchestrator {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    modules: ModuleRegistry,
    playback: Arc<PlaybackQueue>,
    tasks: TaskSupervisor,
    /// Wake phrases spotted in server transcripts
    wake: Option<StdMutex<WakeDetector>>,

    /// The state lock; every transition passes through it
    session: Mutex<Session>,
    snapshot: watch::Sender<Session>,

    connect_gate: Mutex<ConnectGate>,
    connect_attempts: AtomicU64,
    /// Bumped under the state lock each time an abort starts
    abort_epoch: AtomicU64,
    /// Wake handling runs one detection at a time
    wake_gate: Mutex<()>,

    running: AtomicBool,
    cancel: CancellationToken,

    handle: SessionHandle,
    inbox: StdMutex<Option<Inbox>>,
}

impl Orchestrator {
    pub fn new(
        config: SessionConfig,
        wake_word: &WakeWordConfig,
        transport: Arc<dyn Transport>,
        modules: Vec<Arc<dyn CapabilityModule>>,
        playback: Arc<PlaybackQueue>,
    ) -> Arc<Self> {
        let initial = Session::new(config.aec_enabled);
        let (snapshot, snapshot_rx) = watch::channel(initial);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (capture, uplink) = CaptureHandle::new(snapshot_rx.clone(), UPLINK_QUEUE);

        transport.bind(TransportSink::new(event_tx));

        let wake = wake_word.enabled.then(|| {
            let matcher = WakePhraseMatcher::new(&wake_word.phrases, wake_word.policy);
            StdMutex::new(WakeDetector::new(matcher, wake_word.cooldown))
        });

        let tasks = TaskSupervisor::new();
        let handle = SessionHandle::new(command_tx, snapshot_rx, tasks.clone(), capture);

        Arc::new(Self {
            config,
            transport,
            modules: ModuleRegistry::new(modules),
            playback,
            tasks,
            wake,
            session: Mutex::new(initial),
            snapshot,
            connect_gate: Mutex::new(ConnectGate::default()),
            connect_attempts: AtomicU64::new(0),
            abort_epoch: AtomicU64::new(0),
            wake_gate: Mutex::new(()),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handle,
            inbox: StdMutex::new(Some(Inbox {
                events,
                commands,
                uplink,
            })),
        })
    }

    pub fn tasks(&self) -> &TaskSupervisor {
        &self.tasks
    }

    /// Last committed session state
    pub fn session(&self) -> Session {
        *self.snapshot.borrow()
    }

    pub fn device_state(&self) -> DeviceState {
        self.session().state
    }

    #[cfg(test)]
    pub(crate) fn is_audio_channel_opened(&self) -> bool {
        self.transport.is_audio_channel_opened()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the run loop to exit; shutdown happens there
    pub fn request_shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("shutdown requested");
            self.cancel.cancel();
        }
    }

    /// Drive the session until shutdown is requested
    ///
    /// Sets up the modules, opens the channel, starts the modules and then
    /// serializes transport events and module commands. Only a setup that
    /// leaves no working module is an error.
    pub async fn run(self: &Arc<Self>) -> Result<(), SessionError> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SessionError::AlreadyRunning)?;
        let Inbox {
            mut events,
            mut commands,
            uplink,
        } = inbox;
        self.running.store(true, Ordering::SeqCst);

        let ready = self.modules.setup_all(&self.handle).await;
        if ready == 0 && !self.modules.is_empty() {
            error!("no module could be set up");
            self.shutdown().await;
            return Err(SessionError::Startup("every module failed to set up".into()));
        }
        self.modules
            .notify_device_state_changed(self.device_state())
            .await;

        self.spawn_uplink(uplink);

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = self.connect() => {
                if let Err(e) = result {
                    warn!(error = %e, "initial connect failed, will retry on demand");
                }
            }
        }

        self.modules.start_all().await;
        info!(modules = ?self.modules.names(), "session running");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = events.recv() => self.dispatch_event(event).await,
                Some(command) = commands.recv() => self.dispatch_command(command),
                else => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Tear the session down in order; only the first call does anything
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down session");
        self.cancel.cancel();

        let remaining = self.tasks.shutdown(self.config.shutdown_grace).await;
        if remaining > 0 {
            warn!(remaining, "abandoning tasks that ignored cancellation");
        }

        if self.transport.is_audio_channel_opened()
            && tokio::time::timeout(
                self.config.shutdown_grace,
                self.transport.close_audio_channel(),
            )
            .await
            .is_err()
        {
            warn!("timed out closing the audio channel");
        }

        self.modules.stop_all().await;
        self.modules.shutdown_all().await;
        info!("session shut down");
    }

    fn spawn_uplink(self: &Arc<Self>, mut uplink: mpsc::Receiver<Vec<u8>>) {
        self.spawn_unit("capture:uplink", |this| async move {
            while let Some(frame) = uplink.recv().await {
                if let Err(e) = this.transport.send_audio(&frame).await {
                    trace!(error = %e, "capture frame not sent");
                }
            }
            Ok(())
        });
    }

    /// Run `work` as a supervised unit holding a reference to the orchestrator
    fn spawn_unit<F, Fut>(self: &Arc<Self>, name: &str, work: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.tasks.spawn(name, work(Arc::clone(self))).is_none() {
            debug!(task = name, "not spawned, shutting down");
        }
    }

    async fn dispatch_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::IncomingJson(value) => self.on_incoming_json(value).await,
            TransportEvent::IncomingAudio(frame) => {
                trace!(bytes = frame.len(), "incoming audio");
                self.modules.notify_incoming_audio(&frame).await;
            }
            TransportEvent::NetworkError(message) => {
                error!(%message, "network error");
                self.update_session(|s| s.keep_listening = false).await;
            }
            TransportEvent::AudioChannelOpened => {
                info!("audio channel opened");
                self.update_session(|s| s.channel_open = true).await;
            }
            TransportEvent::AudioChannelClosed => {
                let was_open = self
                    .update_session(|s| std::mem::replace(&mut s.channel_open, false))
                    .await;
                info!(was_open, "audio channel closed");
                self.spawn_unit("channel:closed", move |this| async move {
                    this.on_channel_closed(was_open).await;
                    Ok(())
                });
            }
        }
    }

    async fn on_incoming_json(self: &Arc<Self>, value: Value) {
        let message = ServerMessage::classify(&value);
        debug!(?message, "incoming json");

        match message {
            ServerMessage::Goodbye => {
                self.update_session(|s| s.keep_listening = false).await;
                self.spawn_unit("state:goodbye", |this| async move {
                    this.set_device_state(DeviceState::Idle).await;
                    info!("conversation ended by server, waiting for wake phrase");
                    Ok(())
                });
                // Not forwarded to modules
                return;
            }
            ServerMessage::Stt { text } => self.check_transcript(&text).await,
            ServerMessage::Tts { state, .. } => self.on_tts(state).await,
            ServerMessage::Hello { .. } | ServerMessage::Other => {}
        }

        self.spawn_unit("modules:json", |this| async move {
            this.modules.notify_incoming_json(&value).await;
            Ok(())
        });
    }

    /// Wake phrases in server transcripts start a conversation from Idle
    async fn check_transcript(self: &Arc<Self>, text: &str) {
        let Some(wake) = &self.wake else {
            return;
        };
        let state = self.session.lock().await.state;
        if state != DeviceState::Idle {
            debug!(%state, "transcript ignored outside idle");
            return;
        }
        let phrase = wake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check(text, tokio::time::Instant::now());
        if let Some(phrase) = phrase {
            info!(%phrase, %text, "wake phrase in transcript");
            let text = text.to_string();
            self.spawn_unit("wake:transcript", move |this| async move {
                this.handle_wake_word(&phrase, &text).await;
                Ok(())
            });
        }
    }

    async fn on_tts(self: &Arc<Self>, state: TtsState) {
        let session = *self.session.lock().await;
        let duplex = session.keep_listening && session.mode == ListeningMode::Realtime;
        match state {
            TtsState::Start => {
                let next = if duplex {
                    DeviceState::Listening
                } else {
                    DeviceState::Speaking
                };
                self.spawn_unit("state:tts_start", move |this| async move {
                    this.set_device_state(next).await;
                    Ok(())
                });
            }
            TtsState::Stop if session.keep_listening => {
                self.spawn_unit("state:tts_stop_resume", |this| async move {
                    this.resume_listening().await;
                    Ok(())
                });
            }
            TtsState::Stop => {
                self.spawn_unit("state:tts_stop_idle", |this| async move {
                    this.set_device_state(DeviceState::Idle).await;
                    info!("turn finished, waiting for wake phrase");
                    Ok(())
                });
            }
            TtsState::SentenceStart | TtsState::Other => {}
        }
    }

    fn dispatch_command(self: &Arc<Self>, command: Command) {
        debug!(?command, "command received");
        match command {
            Command::StartListening => self.spawn_unit("cmd:start_listening", |this| async move {
                this.start_listening_manual().await?;
                Ok(())
            }),
            Command::StopListening => self.spawn_unit("cmd:stop_listening", |this| async move {
                this.stop_listening_manual().await?;
                Ok(())
            }),
            Command::AbortSpeaking(reason) => {
                self.spawn_unit("cmd:abort_speaking", move |this| async move {
                    this.abort_speaking(reason).await;
                    Ok(())
                })
            }
            Command::StartConversation => {
                self.spawn_unit("cmd:start_conversation", |this| async move {
                    this.start_auto_conversation().await?;
                    Ok(())
                })
            }
            Command::WakeWordDetected { phrase, text } => {
                self.spawn_unit("cmd:wake_word", move |this| async move {
                    this.handle_wake_word(&phrase, &text).await;
                    Ok(())
                })
            }
            Command::Shutdown => self.request_shutdown(),
        }
    }
}
