//! State transitions and channel lifecycle

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::{ConnectError, Orchestrator, SessionError};
use crate::events::AbortReason;
use crate::state::{DeviceState, ListeningMode, Session};

impl Orchestrator {
    /// Apply `f` under the state lock and publish the result
    pub(super) async fn update_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.session.lock().await;
        let out = f(&mut session);
        self.snapshot.send_replace(*session);
        out
    }

    /// Make sure the audio channel is open
    ///
    /// Returns at once when the channel is already open. Otherwise one open
    /// attempt runs at a time, bounded by the connect timeout; callers that
    /// queued behind it get its outcome instead of starting another.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.transport.is_audio_channel_opened() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(ConnectError::ShuttingDown);
        }

        let seen = self.connect_attempts.load(Ordering::SeqCst);
        let mut gate = self.connect_gate.lock().await;
        if self.transport.is_audio_channel_opened() {
            return Ok(());
        }
        if self.connect_attempts.load(Ordering::SeqCst) != seen {
            if let Some(outcome) = gate.last.clone() {
                debug!("sharing outcome of concurrent connect");
                return outcome;
            }
        }

        info!(transport = self.transport.name(), "opening audio channel");
        let limit = self.config.connect_timeout;
        let outcome = match tokio::time::timeout(limit, self.transport.open_audio_channel()).await
        {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ConnectError::Refused),
            Ok(Err(e)) => Err(ConnectError::Transport(e)),
            Err(_) => Err(ConnectError::Timeout(limit)),
        };
        gate.last = Some(outcome.clone());
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        drop(gate);

        match &outcome {
            Ok(()) => {
                self.update_session(|s| s.channel_open = true).await;
                info!("audio channel ready");
                self.modules.notify_protocol_connected().await;
            }
            Err(e) => warn!(error = %e, "failed to open audio channel"),
        }
        outcome
    }

    /// Commit a new device state
    ///
    /// Returns false when the state already equals `next`. Modules are told
    /// after the lock is released.
    pub async fn set_device_state(&self, next: DeviceState) -> bool {
        let (previous, epoch) = {
            let mut session = self.session.lock().await;
            if session.state == next {
                return false;
            }
            let previous = std::mem::replace(&mut session.state, next);
            self.snapshot.send_replace(*session);
            (previous, self.abort_epoch.load(Ordering::SeqCst))
        };
        info!(from = %previous, to = %next, "state transition");

        self.modules.notify_device_state_changed(next).await;

        match next {
            DeviceState::Listening => {
                // Let the backend settle before capture resumes after an abort
                tokio::time::sleep(self.config.listen_settle).await;
                self.settle_abort(epoch).await;
            }
            DeviceState::Idle => self.settle_abort(epoch).await,
            DeviceState::Speaking => {}
        }
        true
    }

    /// Clear the abort flag unless another abort started after `epoch`
    async fn settle_abort(&self, epoch: u64) {
        self.update_session(|s| {
            if self.abort_epoch.load(Ordering::SeqCst) == epoch {
                s.aborted = false;
            }
        })
        .await;
    }

    /// Interrupt the backend's reply
    ///
    /// A call made while a previous abort is still settling does nothing.
    pub async fn abort_speaking(&self, reason: AbortReason) {
        let epoch = self
            .update_session(|s| {
                if std::mem::replace(&mut s.aborted, true) {
                    None
                } else {
                    Some(self.abort_epoch.fetch_add(1, Ordering::SeqCst) + 1)
                }
            })
            .await;
        let Some(epoch) = epoch else {
            debug!(%reason, "abort already in progress");
            return;
        };
        info!(%reason, "aborting speech");

        if self.transport.is_audio_channel_opened() {
            if let Err(e) = self.transport.send_abort_speaking(reason).await {
                warn!(error = %e, "failed to send abort");
            }
        }
        if !self.set_device_state(DeviceState::Idle).await {
            self.settle_abort(epoch).await;
        }
    }

    /// Push-to-talk pressed
    pub async fn start_listening_manual(&self) -> Result<(), SessionError> {
        self.connect().await?;
        self.update_session(|s| s.keep_listening = false).await;

        if self.device_state() == DeviceState::Speaking {
            info!("interrupting speech for manual listening");
            self.transport.send_abort_speaking(AbortReason::None).await?;
            self.set_device_state(DeviceState::Idle).await;
        }
        self.transport
            .send_start_listening(ListeningMode::Manual)
            .await?;
        self.set_device_state(DeviceState::Listening).await;
        Ok(())
    }

    /// Push-to-talk released
    pub async fn stop_listening_manual(&self) -> Result<(), SessionError> {
        self.transport.send_stop_listening().await?;
        self.set_device_state(DeviceState::Idle).await;
        Ok(())
    }

    /// Hands-free conversation that re-arms listening after every reply
    pub async fn start_auto_conversation(&self) -> Result<(), SessionError> {
        self.connect().await?;
        let mode = self
            .update_session(|s| {
                s.mode = ListeningMode::for_conversation(s.aec_enabled);
                s.keep_listening = true;
                s.mode
            })
            .await;
        self.transport.send_start_listening(mode).await?;
        self.set_device_state(DeviceState::Listening).await;
        Ok(())
    }

    /// A wake phrase was heard, locally or in a server transcript
    ///
    /// Detections are handled one at a time, so a second one sees the state
    /// the first left behind.
    pub async fn handle_wake_word(&self, phrase: &str, text: &str) {
        let _turn = self.wake_gate.lock().await;
        let state = self.session.lock().await.state;
        info!(%phrase, %state, "handling wake phrase");

        let result = match state {
            DeviceState::Idle => self.wake_from_idle().await,
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::WakeWordDetected).await;
                self.playback.clear();
                self.start_auto_conversation().await
            }
            DeviceState::Listening => {
                debug!(%text, "already listening, wake phrase ignored");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "could not start conversation, awaiting wake phrase");
        }
    }

    async fn wake_from_idle(&self) -> Result<(), SessionError> {
        self.connect().await?;
        self.transport
            .send_wake_word_detected(&self.config.greeting)
            .await?;
        self.start_auto_conversation().await
    }

    /// Re-arm listening once the reply has finished playing
    pub(super) async fn resume_listening(&self) {
        self.playback.wait_drained().await;

        let session = *self.session.lock().await;
        let in_turn = matches!(
            session.state,
            DeviceState::Speaking | DeviceState::Listening
        );
        if !in_turn || !session.keep_listening {
            debug!(state = %session.state, "conversation moved on, not resuming");
            return;
        }

        self.set_device_state(DeviceState::Listening).await;
        // Realtime keeps the backend listening through the reply
        if session.mode != ListeningMode::Realtime {
            if let Err(e) = self.transport.send_start_listening(session.mode).await {
                warn!(error = %e, "failed to resume listening");
            }
        }
    }

    /// Channel went away: back to Idle, then one delayed reconnect
    pub(super) async fn on_channel_closed(&self, was_open: bool) {
        self.set_device_state(DeviceState::Idle).await;
        if !was_open || !self.is_running() {
            return;
        }

        info!(delay = ?self.config.reconnect_delay, "reconnecting");
        tokio::time::sleep(self.config.reconnect_delay).await;
        if let Err(e) = self.connect().await {
            warn!(error = %e, "reconnect failed, awaiting wake phrase");
        }
    }
}
