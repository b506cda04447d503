//! Capability modules plugged into the session
//!
//! A module reacts to session events and asks for changes through its
//! [`SessionHandle`]. The orchestrator never depends on a concrete module.

mod registry;

pub use registry::ModuleRegistry;

#[cfg(test)]
pub(crate) use registry::tests::{Journal, RecordingModule};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::orchestrator::SessionHandle;
use crate::state::DeviceState;

/// Where a module sits in the pipeline
///
/// Modules are set up and notified in ascending stage order and torn down
/// in reverse. Modules sharing a stage keep their registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleStage {
    /// Device audio in and out
    Audio,
    /// Consumers of captured audio, e.g. wake phrase spotting
    Detection,
    /// User facing surfaces
    Presentation,
}

impl std::fmt::Display for ModuleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleStage::Audio => "audio",
            ModuleStage::Detection => "detection",
            ModuleStage::Presentation => "presentation",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait CapabilityModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(&self) -> ModuleStage;

    /// Called once before anything else. A failure keeps the module out of
    /// every later call except `shutdown`.
    async fn setup(&self, session: SessionHandle) -> Result<()>;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn on_device_state_changed(&self, _state: DeviceState) -> Result<()> {
        Ok(())
    }

    async fn on_protocol_connected(&self) -> Result<()> {
        Ok(())
    }

    async fn on_incoming_audio(&self, _frame: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn on_incoming_json(&self, _message: &Value) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {module} failed in {op}: {message}")]
    Failed {
        module: &'static str,
        op: &'static str,
        message: String,
    },

    #[error("module {module} panicked in {op}")]
    Panicked { module: &'static str, op: &'static str },
}
