//! Scripted in-memory transport for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Transport, TransportError, TransportSink};
use crate::events::AbortReason;
use crate::state::ListeningMode;

/// Outbound frame as recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    StartListening(ListeningMode),
    StopListening,
    Abort(AbortReason),
    WakeWordDetected(String),
    Audio(usize),
}

/// What the next open attempts do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    Succeed,
    Refuse,
    Fail,
    Hang,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    sink: Mutex<Option<TransportSink>>,
    opened: AtomicBool,
    behavior: Mutex<OpenBehavior>,
    open_delay: Mutex<Duration>,
    send_delay: Mutex<Duration>,
    sent: Mutex<Vec<Sent>>,
    open_attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            opened: AtomicBool::new(false),
            behavior: Mutex::new(OpenBehavior::Succeed),
            open_delay: Mutex::new(Duration::ZERO),
            send_delay: Mutex::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
            open_attempts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: OpenBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    /// Mark the channel open without an open attempt
    pub fn force_open(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    /// Drop the channel as if the server hung up
    pub fn drop_channel(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn sink(&self) -> TransportSink {
        self.sink.lock().unwrap().clone().expect("transport not bound")
    }

    async fn record(&self, frame: Sent) -> Result<(), TransportError> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_audio_channel_opened() {
            return Err(TransportError::NotOpen);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn bind(&self, sink: TransportSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    async fn open_audio_channel(&self) -> Result<bool, TransportError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = *self.open_delay.lock().unwrap();
        let behavior = *self.behavior.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match behavior {
            OpenBehavior::Succeed => {
                self.opened.store(true, Ordering::SeqCst);
                Ok(true)
            }
            OpenBehavior::Refuse => Ok(false),
            OpenBehavior::Fail => Err(TransportError::Connect("connection refused".into())),
            OpenBehavior::Hang => std::future::pending().await,
        }
    }

    async fn close_audio_channel(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<(), TransportError> {
        self.record(Sent::StartListening(mode)).await
    }

    async fn send_stop_listening(&self) -> Result<(), TransportError> {
        self.record(Sent::StopListening).await
    }

    async fn send_abort_speaking(&self, reason: AbortReason) -> Result<(), TransportError> {
        self.record(Sent::Abort(reason)).await
    }

    async fn send_wake_word_detected(&self, text: &str) -> Result<(), TransportError> {
        self.record(Sent::WakeWordDetected(text.to_string())).await
    }

    async fn send_audio(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.record(Sent::Audio(frame.len())).await
    }
}
