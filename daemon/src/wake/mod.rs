//! Wake phrase detection
//!
//! [`WakeWordModule`] subscribes to raw capture frames through a drop-oldest
//! queue and feeds them to a streaming [`Recognizer`]. Finalized text that
//! contains a wake phrase becomes a [`Command::WakeWordDetected`]; the
//! orchestrator decides what that means for the current state.

mod matcher;

pub use matcher::{WakeDetector, WakePhraseMatcher};

use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::audio::FrameQueue;
use crate::config::WakeWordConfig;
use crate::lifecycle::TaskHandle;
use crate::modules::{CapabilityModule, ModuleStage};
use crate::orchestrator::{Command, SessionHandle};
use crate::state::DeviceState;

/// Streaming speech recognizer
pub trait Recognizer: Send {
    /// Feed one PCM frame; returns text once an utterance is finalized
    fn accept(&mut self, pcm: &[i16]) -> Option<String>;

    /// Drop any partial utterance
    fn reset(&mut self);
}

pub struct WakeWordModule {
    config: WakeWordConfig,
    recognizer: Mutex<Option<Box<dyn Recognizer>>>,
    queue: Arc<FrameQueue>,
    session: OnceLock<SessionHandle>,
    detector: Mutex<Option<TaskHandle>>,
}

impl WakeWordModule {
    pub fn new(config: WakeWordConfig, recognizer: Option<Box<dyn Recognizer>>) -> Self {
        let queue = Arc::new(FrameQueue::new(config.queue_capacity));
        Self {
            config,
            recognizer: Mutex::new(recognizer),
            queue,
            session: OnceLock::new(),
            detector: Mutex::new(None),
        }
    }

    fn has_recognizer(&self) -> bool {
        self.recognizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

async fn detect(
    queue: Arc<FrameQueue>,
    mut recognizer: Box<dyn Recognizer>,
    mut detector: WakeDetector,
    session: SessionHandle,
) -> Result<()> {
    loop {
        let frame = queue.pop().await;
        let Some(text) = recognizer.accept(&frame) else {
            continue;
        };
        debug!(%text, "utterance recognized");

        let Some(phrase) = detector.check(&text, tokio::time::Instant::now()) else {
            continue;
        };
        info!(%phrase, "wake phrase detected");
        recognizer.reset();
        if session.device_state() == DeviceState::Listening {
            debug!("already listening, wake phrase not signalled");
            continue;
        }
        // Audio captured before the trigger belongs to the wake phrase
        queue.clear();

        if session
            .send(Command::WakeWordDetected { phrase, text })
            .await
            .is_err()
        {
            debug!("session closed, stopping wake detection");
            return Ok(());
        }
    }
}

#[async_trait]
impl CapabilityModule for WakeWordModule {
    fn name(&self) -> &'static str {
        "wake_word"
    }

    fn stage(&self) -> ModuleStage {
        ModuleStage::Detection
    }

    async fn setup(&self, session: SessionHandle) -> Result<()> {
        if self.session.set(session.clone()).is_err() {
            anyhow::bail!("wake word module set up twice");
        }
        if !self.config.enabled {
            info!("wake word detection disabled");
            return Ok(());
        }
        if !self.has_recognizer() {
            info!("no local recognizer, relying on server transcripts for wake phrases");
            return Ok(());
        }
        session.capture().subscribe(Arc::clone(&self.queue));
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let Some(recognizer) = self
            .recognizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Ok(());
        };
        let session = self
            .session
            .get()
            .ok_or_else(|| anyhow::anyhow!("wake word module started before setup"))?
            .clone();

        let matcher = WakePhraseMatcher::new(&self.config.phrases, self.config.policy);
        if matcher.is_empty() {
            anyhow::bail!("wake word detection enabled without any phrases");
        }
        let detector = WakeDetector::new(matcher, self.config.cooldown);
        info!(
            phrases = ?self.config.phrases,
            policy = ?self.config.policy,
            "wake word detection started"
        );

        let handle = session.tasks().spawn(
            "wake:detect",
            detect(Arc::clone(&self.queue), recognizer, detector, session.clone()),
        );
        *self.detector.lock().unwrap_or_else(|e| e.into_inner()) = handle;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.detector.lock().unwrap_or_else(|e| e.into_inner()).take() {
            debug!(unit = handle.name(), dropped = self.queue.dropped(), "stopping detection");
            handle.cancel();
        }
        if let Some(session) = self.session.get() {
            session.capture().unsubscribe(&self.queue);
        }
        self.queue.clear();
        Ok(())
    }
}
