//! murmur-daemon: voice assistant session daemon
//!
//! Bridges the local microphone and speaker pipeline to a conversational
//! backend over a persistent duplex channel:
//! - Session orchestrator owning the Idle / Listening / Speaking state
//! - WebSocket transport to the backend
//! - Capability modules for audio capture and playback, wake phrases and the
//!   control socket
//!
//! Audio device I/O, codecs and recognizer models are external; they plug in
//! through the capture handle, the playback queue and the recognizer trait.

mod audio;
mod config;
mod events;
mod ipc;
mod lifecycle;
mod modules;
mod orchestrator;
mod state;
mod transport;
mod wake;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audio::{AudioModule, CaptureModule, PlaybackQueue};
use crate::config::Config;
use crate::ipc::ControlModule;
use crate::lifecycle::ShutdownSignal;
use crate::modules::CapabilityModule;
use crate::orchestrator::Orchestrator;
use crate::wake::WakeWordModule;

/// Decoded reply frames buffered ahead of the output device
const PLAYBACK_FRAMES: usize = 256;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "murmur-daemon starting");

    match run().await {
        Ok(()) => {
            info!("murmur-daemon stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "murmur-daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        socket = ?config.socket_path,
        url = %config.transport.url,
        protocol = ?config.transport.protocol,
        "configuration loaded"
    );

    let transport = transport::build(&config.transport)?;

    let playback = Arc::new(PlaybackQueue::new(PLAYBACK_FRAMES));
    let frame_duration =
        Duration::from_millis(u64::from(config.transport.audio_params.frame_duration));

    let mut modules: Vec<Arc<dyn CapabilityModule>> = vec![
        Arc::new(AudioModule::new(Arc::clone(&playback), frame_duration)),
        // No local recognizer is bundled; server transcripts carry wake phrases
        Arc::new(WakeWordModule::new(config.wake_word.clone(), None)),
        Arc::new(ControlModule::new(&config.socket_path)),
    ];
    match &config.capture_source {
        Some(source) => {
            let params = &config.transport.audio_params;
            modules.push(Arc::new(CaptureModule::new(
                source,
                params.sample_rate,
                params.frame_duration,
            )));
        }
        None => info!("no capture source configured, microphone audio disabled"),
    }

    let orchestrator = Orchestrator::new(
        config.session.clone(),
        &config.wake_word,
        transport,
        modules,
        playback,
    );

    // Signals only request shutdown; the run loop performs it
    match ShutdownSignal::install() {
        Ok(mut signals) => {
            let watcher = Arc::clone(&orchestrator);
            orchestrator.tasks().spawn("signals:watch", async move {
                let reason = signals.recv().await;
                info!(%reason, "shutdown signal received");
                watcher.request_shutdown();
                Ok(())
            });
        }
        Err(e) => warn!(?e, "failed to install signal handlers, continuing without them"),
    }

    orchestrator.run().await?;
    Ok(())
}
