//! Playback queue and the audio capability module
//!
//! Incoming audio frames are queued for the output device. The orchestrator
//! clears the queue on interruption and waits for it to drain before it
//! re-arms listening.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::lifecycle::TaskHandle;
use crate::modules::{CapabilityModule, ModuleStage};
use crate::orchestrator::SessionHandle;
use crate::state::{DeviceState, ListeningMode};

#[derive(Default)]
struct PlaybackState {
    frames: VecDeque<Vec<u8>>,
    /// A frame has been handed to the device and has not finished
    playing: bool,
}

/// Frames waiting for the output device
pub struct PlaybackQueue {
    state: Mutex<PlaybackState>,
    capacity: usize,
    frame_ready: Notify,
    drained: Notify,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PlaybackState::default()),
            capacity: capacity.max(1),
            frame_ready: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, frame: Vec<u8>) {
        {
            let mut state = self.state();
            if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                trace!("playback queue full, dropping oldest frame");
            }
            state.frames.push_back(frame);
        }
        self.frame_ready.notify_one();
    }

    /// Next frame for the device; marks playback as in progress
    pub async fn next_frame(&self) -> Vec<u8> {
        loop {
            let notified = self.frame_ready.notified();
            {
                let mut state = self.state();
                if let Some(frame) = state.frames.pop_front() {
                    state.playing = true;
                    return frame;
                }
            }
            notified.await;
        }
    }

    /// The device finished the frame it was given
    pub fn finish_frame(&self) {
        let drained = {
            let mut state = self.state();
            state.playing = false;
            state.frames.is_empty()
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Discard everything not yet handed to the device
    pub fn clear(&self) {
        let drained = {
            let mut state = self.state();
            let discarded = state.frames.len();
            state.frames.clear();
            if discarded > 0 {
                debug!(discarded, "playback queue cleared");
            }
            !state.playing
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state().frames.len()
    }

    pub fn is_drained(&self) -> bool {
        let state = self.state();
        state.frames.is_empty() && !state.playing
    }

    /// Wait until nothing is queued or playing
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }
}

/// Marks the current frame finished even if the output unit is cancelled
struct FrameInFlight(Arc<PlaybackQueue>);

impl Drop for FrameInFlight {
    fn drop(&mut self) {
        self.0.finish_frame();
    }
}

async fn play_out(playback: Arc<PlaybackQueue>, frame_duration: Duration) -> Result<()> {
    loop {
        let frame = playback.next_frame().await;
        let _in_flight = FrameInFlight(Arc::clone(&playback));
        trace!(bytes = frame.len(), "playing frame");
        tokio::time::sleep(frame_duration).await;
    }
}

/// Feeds incoming audio to the playback queue and paces its output
pub struct AudioModule {
    playback: Arc<PlaybackQueue>,
    frame_duration: Duration,
    session: OnceLock<SessionHandle>,
    output: Mutex<Option<TaskHandle>>,
}

impl AudioModule {
    pub fn new(playback: Arc<PlaybackQueue>, frame_duration: Duration) -> Self {
        Self {
            playback,
            frame_duration,
            session: OnceLock::new(),
            output: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<&SessionHandle> {
        self.session
            .get()
            .ok_or_else(|| anyhow::anyhow!("audio module used before setup"))
    }
}

#[async_trait]
impl CapabilityModule for AudioModule {
    fn name(&self) -> &'static str {
        "audio"
    }

    fn stage(&self) -> ModuleStage {
        ModuleStage::Audio
    }

    async fn setup(&self, session: SessionHandle) -> Result<()> {
        if self.session.set(session).is_err() {
            anyhow::bail!("audio module set up twice");
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let playback = Arc::clone(&self.playback);
        let frame_duration = self.frame_duration;
        // Stands in for the output device: consumes frames at their nominal rate
        let handle = self
            .session()?
            .tasks()
            .spawn("audio:output", play_out(playback, frame_duration));
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = handle;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.output.lock().unwrap_or_else(|e| e.into_inner()).take() {
            debug!(unit = handle.name(), "stopping output");
            handle.cancel();
        }
        self.playback.clear();
        Ok(())
    }

    async fn on_device_state_changed(&self, state: DeviceState) -> Result<()> {
        let handle = self.session()?;
        let duplex = handle.keep_listening() && handle.listening_mode() == ListeningMode::Realtime;
        let stale = match state {
            // Reply audio must not play over the user
            DeviceState::Listening => !duplex,
            DeviceState::Idle => handle.session().aborted,
            DeviceState::Speaking => false,
        };
        if stale {
            self.playback.clear();
        }
        Ok(())
    }

    async fn on_incoming_audio(&self, frame: &[u8]) -> Result<()> {
        if self.session()?.session().aborted {
            trace!("dropping audio received after abort");
            return Ok(());
        }
        self.playback.enqueue(frame.to_vec());
        Ok(())
    }
}
