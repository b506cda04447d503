//! Read-only session view and command queue handed to modules

use tokio::sync::{mpsc, watch};

use crate::audio::CaptureHandle;
use crate::events::AbortReason;
use crate::lifecycle::TaskSupervisor;
use crate::state::{DeviceState, ListeningMode, Session};

use super::SessionError;

/// Requests modules can make of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Push-to-talk start
    StartListening,
    /// Push-to-talk stop
    StopListening,
    AbortSpeaking(AbortReason),
    /// Hands-free conversation with keep-listening on
    StartConversation,
    /// A wake phrase was recognized locally
    WakeWordDetected { phrase: String, text: String },
    Shutdown,
}

/// What a capability module gets to see and do
///
/// State reads are snapshots of the last committed session. Changes go
/// through the command queue and are applied by the orchestrator.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Session>,
    tasks: TaskSupervisor,
    capture: CaptureHandle,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        snapshot: watch::Receiver<Session>,
        tasks: TaskSupervisor,
        capture: CaptureHandle,
    ) -> Self {
        Self {
            commands,
            snapshot,
            tasks,
            capture,
        }
    }

    /// Last committed session state
    pub fn session(&self) -> Session {
        *self.snapshot.borrow()
    }

    pub fn device_state(&self) -> DeviceState {
        self.session().state
    }

    pub fn listening_mode(&self) -> ListeningMode {
        self.session().mode
    }

    pub fn keep_listening(&self) -> bool {
        self.session().keep_listening
    }

    /// Supervisor for the module's own background work
    pub fn tasks(&self) -> &TaskSupervisor {
        &self.tasks
    }

    /// Entry point for the capture pipeline
    pub fn capture(&self) -> &CaptureHandle {
        &self.capture
    }

    /// Queue a command for the orchestrator
    pub async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}
