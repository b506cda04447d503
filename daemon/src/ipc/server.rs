//! Unix domain socket control surface
//!
//! Front ends (menu bar app, CLI) send requests and can subscribe to state
//! change notifications. Requests that change the session are queued as
//! commands; the orchestrator applies them.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::AbortReason;
use crate::lifecycle::TaskHandle;
use crate::modules::{CapabilityModule, ModuleStage};
use crate::orchestrator::{Command, SessionHandle};
use crate::state::DeviceState;

use super::protocol::{read_frame, write_frame, DaemonStatus, Notification, Request, Response};

const NOTIFY_BUFFER: usize = 64;

/// Shared by every client connection
struct Shared {
    session: SessionHandle,
    started_at: Instant,
    notifications: broadcast::Sender<Notification>,
    closing: CancellationToken,
}

#[derive(Default)]
struct Runtime {
    listener: Option<UnixListener>,
    accept: Option<TaskHandle>,
    last_state: Option<DeviceState>,
}

/// Serves the control socket as a capability module
pub struct ControlModule {
    socket_path: PathBuf,
    notifications: broadcast::Sender<Notification>,
    closing: CancellationToken,
    shared: OnceLock<Arc<Shared>>,
    runtime: Mutex<Runtime>,
}

impl ControlModule {
    pub fn new(socket_path: &Path) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFY_BUFFER);
        Self {
            socket_path: socket_path.to_owned(),
            notifications,
            closing: CancellationToken::new(),
            shared: OnceLock::new(),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("failed to remove stale socket")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("failed to bind Unix socket")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = ?self.socket_path, "control socket listening");
        Ok(listener)
    }
}

async fn accept_loop(listener: UnixListener, shared: Arc<Shared>) -> Result<()> {
    loop {
        tokio::select! {
            _ = shared.closing.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let client = Arc::clone(&shared);
                    shared.session.tasks().spawn("ipc:client", async move {
                        tokio::select! {
                            _ = client.closing.cancelled() => Ok(()),
                            result = serve_client(stream, Arc::clone(&client)) => result,
                        }
                    });
                }
                Err(e) => error!(?e, "accept error"),
            },
        }
    }
}

async fn serve_client(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));
    let mut forwarder: Option<TaskHandle> = None;

    let result: Result<()> = async {
        while let Some(body) = read_frame(&mut reader).await? {
            let response = match serde_json::from_slice::<Request>(&body) {
                Ok(request) => {
                    debug!(?request, "received request");
                    if request == Request::Subscribe && forwarder.is_none() {
                        forwarder = subscribe(&shared, Arc::clone(&writer));
                        debug!("client subscribed to notifications");
                    }
                    process_request(request, &shared).await
                }
                Err(e) => Response::error("invalid_request", e.to_string()),
            };
            write_frame(&mut *writer.lock().await, &response).await?;
        }
        debug!("client disconnected");
        Ok(())
    }
    .await;

    if let Some(handle) = forwarder {
        handle.cancel();
    }
    result
}

/// Forward notifications to one client until it goes away
fn subscribe(shared: &Shared, writer: Arc<AsyncMutex<OwnedWriteHalf>>) -> Option<TaskHandle> {
    // Subscribed before the confirmation is written, so nothing is missed after it
    let mut notifications = shared.notifications.subscribe();
    shared.session.tasks().spawn("ipc:notify", async move {
        loop {
            match notifications.recv().await {
                Ok(note) => {
                    if let Err(e) = write_frame(&mut *writer.lock().await, &note).await {
                        debug!(?e, "subscriber gone");
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    })
}

async fn process_request(request: Request, shared: &Shared) -> Response {
    let command = match request {
        Request::Ping => return Response::Pong,
        Request::GetStatus => {
            let uptime = shared.started_at.elapsed().as_secs();
            return Response::Status(DaemonStatus::new(&shared.session.session(), uptime));
        }
        Request::Subscribe => return Response::Subscribed,
        Request::StartListening => Command::StartListening,
        Request::StopListening => Command::StopListening,
        Request::AbortSpeaking => Command::AbortSpeaking(AbortReason::UserInterruption),
        Request::StartConversation => Command::StartConversation,
        Request::Shutdown => {
            info!("shutdown requested over control socket");
            Command::Shutdown
        }
    };
    match shared.session.send(command).await {
        Ok(()) => Response::Accepted,
        Err(e) => Response::error("session_closed", e.to_string()),
    }
}

#[async_trait]
impl CapabilityModule for ControlModule {
    fn name(&self) -> &'static str {
        "control"
    }

    fn stage(&self) -> ModuleStage {
        ModuleStage::Presentation
    }

    async fn setup(&self, session: SessionHandle) -> Result<()> {
        let listener = self.bind()?;
        let shared = Arc::new(Shared {
            session,
            started_at: Instant::now(),
            notifications: self.notifications.clone(),
            closing: self.closing.clone(),
        });
        if self.shared.set(shared).is_err() {
            anyhow::bail!("control module set up twice");
        }
        self.runtime().listener = Some(listener);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let shared = self
            .shared
            .get()
            .context("control module started before setup")?;
        let listener = self
            .runtime()
            .listener
            .take()
            .context("control socket already serving")?;
        let handle = shared
            .session
            .tasks()
            .spawn("ipc:accept", accept_loop(listener, Arc::clone(shared)));
        self.runtime().accept = handle;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.closing.cancel();
        if let Some(handle) = self.runtime().accept.take() {
            handle.cancel();
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.runtime().listener = None;
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("failed to remove socket file")?;
        }
        info!("control socket closed");
        Ok(())
    }

    async fn on_device_state_changed(&self, state: DeviceState) -> Result<()> {
        let previous = self.runtime().last_state.replace(state);
        match previous {
            Some(previous) if previous != state => {
                // No subscribers is not an error
                let _ = self
                    .notifications
                    .send(Notification::StateChanged { state, previous });
            }
            _ => {}
        }
        Ok(())
    }
}
