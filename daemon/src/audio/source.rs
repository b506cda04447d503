//! Microphone input read from a raw PCM stream
//!
//! The stream carries signed 16-bit little-endian mono samples, e.g. a FIFO
//! fed by `arecord -f S16_LE -r 16000 -c 1`. It is read on a dedicated
//! thread, which only talks to the session through its [`CaptureHandle`].

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info};

use super::CaptureHandle;
use crate::modules::{CapabilityModule, ModuleStage};
use crate::orchestrator::SessionHandle;

/// Feeds captured frames into the session
pub struct CaptureModule {
    source: PathBuf,
    frame_samples: usize,
    capture: OnceLock<CaptureHandle>,
    running: Arc<AtomicBool>,
}

impl CaptureModule {
    pub fn new(source: impl Into<PathBuf>, sample_rate: u32, frame_duration_ms: u32) -> Self {
        let frame_samples = (sample_rate as usize * frame_duration_ms as usize / 1000).max(1);
        Self {
            source: source.into(),
            frame_samples,
            capture: OnceLock::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Read whole frames until end of stream or until `running` is cleared
///
/// A trailing partial frame is discarded. Returns the number of frames read.
fn pump(
    mut reader: impl Read,
    frame_samples: usize,
    capture: &CaptureHandle,
    running: &AtomicBool,
) -> io::Result<u64> {
    let mut bytes = vec![0u8; frame_samples * 2];
    let mut pcm = vec![0i16; frame_samples];
    let mut frames = 0;

    while running.load(Ordering::SeqCst) {
        match reader.read_exact(&mut bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        for (sample, pair) in pcm.iter_mut().zip(bytes.chunks_exact(2)) {
            *sample = i16::from_le_bytes([pair[0], pair[1]]);
        }
        capture.push_frame(&pcm, bytes.clone());
        frames += 1;
    }
    Ok(frames)
}

#[async_trait]
impl CapabilityModule for CaptureModule {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn stage(&self) -> ModuleStage {
        ModuleStage::Audio
    }

    async fn setup(&self, session: SessionHandle) -> Result<()> {
        if !self.source.exists() {
            anyhow::bail!("capture source {} does not exist", self.source.display());
        }
        if self.capture.set(session.capture().clone()).is_err() {
            anyhow::bail!("capture module set up twice");
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let capture = self
            .capture
            .get()
            .context("capture module started before setup")?
            .clone();
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("capture already running");
        }

        let source = self.source.clone();
        let frame_samples = self.frame_samples;
        let running = Arc::clone(&self.running);

        // Opening a FIFO blocks until a writer appears, so it happens on the thread too
        let spawned = thread::Builder::new()
            .name("murmur-capture".to_string())
            .spawn(move || {
                info!(source = %source.display(), frame_samples, "capture thread started");
                let result = File::open(&source)
                    .and_then(|file| pump(file, frame_samples, &capture, &running));
                match result {
                    Ok(frames) => info!(
                        frames,
                        uplink_dropped = capture.uplink_dropped(),
                        "capture stream ended"
                    ),
                    Err(e) => error!(source = %source.display(), error = %e, "capture failed"),
                }
                running.store(false, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            self.running.store(false, Ordering::SeqCst);
            return Err(e).context("failed to spawn capture thread");
        }
        Ok(())
    }

    /// Takes effect at the next frame; a read blocked on an idle writer ends with the process
    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
