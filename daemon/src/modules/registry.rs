//! Ordered collection of capability modules and their lifecycle

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{CapabilityModule, ModuleError};
use crate::orchestrator::SessionHandle;
use crate::state::DeviceState;

#[derive(Debug, Default, Clone, Copy)]
struct Lifecycle {
    setup_attempted: bool,
    /// Setup succeeded; the module receives events
    ready: bool,
    started: bool,
    stopped: bool,
    shut_down: bool,
}

struct Slot {
    module: Arc<dyn CapabilityModule>,
    lifecycle: Mutex<Lifecycle>,
}

impl Slot {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_ready(&self) -> bool {
        self.lifecycle().ready
    }
}

/// Run one module call, turning errors and panics into [`ModuleError`]
async fn isolate<F>(module: &'static str, op: &'static str, call: F) -> Result<(), ModuleError>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ModuleError::Failed {
            module,
            op,
            message: format!("{e:#}"),
        }),
        Err(_) => Err(ModuleError::Panicked { module, op }),
    }
}

fn report(result: Result<(), ModuleError>) {
    if let Err(e) = result {
        warn!(error = %e, "module call failed");
    }
}

/// Modules sorted by stage
///
/// Every call is isolated: one module failing or panicking never keeps the
/// others from being set up, started, notified or torn down.
pub struct ModuleRegistry {
    slots: Vec<Slot>,
}

impl ModuleRegistry {
    pub fn new(mut modules: Vec<Arc<dyn CapabilityModule>>) -> Self {
        // Stable, so registration order breaks ties within a stage
        modules.sort_by_key(|m| m.stage());
        let slots = modules
            .into_iter()
            .map(|module| Slot {
                module,
                lifecycle: Mutex::new(Lifecycle::default()),
            })
            .collect();
        Self { slots }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Module names in lifecycle order
    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.module.name()).collect()
    }

    /// Set up every module in stage order; returns how many succeeded
    pub async fn setup_all(&self, session: &SessionHandle) -> usize {
        let mut ready = 0;
        for slot in &self.slots {
            let name = slot.module.name();
            slot.lifecycle().setup_attempted = true;
            match isolate(name, "setup", slot.module.setup(session.clone())).await {
                Ok(()) => {
                    slot.lifecycle().ready = true;
                    ready += 1;
                    debug!(module = name, stage = %slot.module.stage(), "module set up");
                }
                Err(e) => warn!(module = name, error = %e, "module setup failed, skipping"),
            }
        }
        info!(ready, total = self.slots.len(), "modules set up");
        ready
    }

    pub async fn start_all(&self) {
        for slot in &self.slots {
            let name = slot.module.name();
            {
                let lifecycle = slot.lifecycle();
                if !lifecycle.ready || lifecycle.started {
                    continue;
                }
            }
            match isolate(name, "start", slot.module.start()).await {
                Ok(()) => {
                    slot.lifecycle().started = true;
                    debug!(module = name, "module started");
                }
                Err(e) => warn!(module = name, error = %e, "module start failed"),
            }
        }
    }

    /// Stop started modules in reverse order, at most once each
    pub async fn stop_all(&self) {
        for slot in self.slots.iter().rev() {
            {
                let mut lifecycle = slot.lifecycle();
                if !lifecycle.started || lifecycle.stopped {
                    continue;
                }
                lifecycle.stopped = true;
            }
            report(isolate(slot.module.name(), "stop", slot.module.stop()).await);
        }
    }

    /// Shut down every module whose setup ran, in reverse order, at most once each
    pub async fn shutdown_all(&self) {
        for slot in self.slots.iter().rev() {
            {
                let mut lifecycle = slot.lifecycle();
                if !lifecycle.setup_attempted || lifecycle.shut_down {
                    continue;
                }
                lifecycle.shut_down = true;
            }
            report(isolate(slot.module.name(), "shutdown", slot.module.shutdown()).await);
        }
    }

    pub async fn notify_device_state_changed(&self, state: DeviceState) {
        let calls = self.ready().map(|m| {
            isolate(m.name(), "on_device_state_changed", m.on_device_state_changed(state))
        });
        join_all(calls).await.into_iter().for_each(report);
    }

    pub async fn notify_protocol_connected(&self) {
        let calls = self
            .ready()
            .map(|m| isolate(m.name(), "on_protocol_connected", m.on_protocol_connected()));
        join_all(calls).await.into_iter().for_each(report);
    }

    pub async fn notify_incoming_audio(&self, frame: &[u8]) {
        let calls = self
            .ready()
            .map(|m| isolate(m.name(), "on_incoming_audio", m.on_incoming_audio(frame)));
        join_all(calls).await.into_iter().for_each(report);
    }

    pub async fn notify_incoming_json(&self, message: &Value) {
        let calls = self
            .ready()
            .map(|m| isolate(m.name(), "on_incoming_json", m.on_incoming_json(message)));
        join_all(calls).await.into_iter().for_each(report);
    }

    fn ready(&self) -> impl Iterator<Item = &Arc<dyn CapabilityModule>> {
        self.slots
            .iter()
            .filter(|s| s.is_ready())
            .map(|s| &s.module)
    }
}
