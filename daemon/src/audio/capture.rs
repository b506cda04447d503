//! Capture boundary
//!
//! The capture pipeline usually runs on its own thread. It gets a
//! [`CaptureHandle`], which only touches thread-safe queues and the published
//! session snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Notify};
use tracing::trace;

use crate::state::Session;

/// Shared PCM frame
pub type PcmFrame = Arc<[i16]>;

/// Bounded frame queue that drops the oldest frame when full
///
/// Producers never block, so a slow consumer only loses stale audio.
pub struct FrameQueue {
    frames: Mutex<VecDeque<PcmFrame>>,
    capacity: usize,
    available: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: PcmFrame) {
        {
            let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
            if frames.len() >= self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        }
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<PcmFrame> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Wait for the next frame
    pub async fn pop(&self) -> PcmFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.available.notified().await;
        }
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames discarded to make room for newer ones
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Handle given to the capture pipeline
#[derive(Clone)]
pub struct CaptureHandle {
    snapshot: watch::Receiver<Session>,
    uplink: mpsc::Sender<Vec<u8>>,
    listeners: Arc<Mutex<Vec<Arc<FrameQueue>>>>,
    uplink_dropped: Arc<AtomicU64>,
}

impl CaptureHandle {
    /// Returns the handle and the receiving end of the uplink queue
    pub fn new(
        snapshot: watch::Receiver<Session>,
        uplink_capacity: usize,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (uplink, uplink_rx) = mpsc::channel(uplink_capacity.max(1));
        let handle = Self {
            snapshot,
            uplink,
            listeners: Arc::new(Mutex::new(Vec::new())),
            uplink_dropped: Arc::new(AtomicU64::new(0)),
        };
        (handle, uplink_rx)
    }

    /// Receive every raw frame, whether or not it is sent upstream
    pub fn subscribe(&self, queue: Arc<FrameQueue>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(queue);
    }

    pub fn unsubscribe(&self, queue: &Arc<FrameQueue>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|q| !Arc::ptr_eq(q, queue));
    }

    /// Whether the session currently wants microphone audio upstream
    pub fn should_capture_audio(&self) -> bool {
        self.snapshot.borrow().should_capture_audio()
    }

    /// Hand over one captured frame
    ///
    /// `pcm` goes to local listeners such as the wake-word detector; `encoded`
    /// is queued for the backend only when capture is wanted. Returns whether
    /// the encoded frame was queued.
    pub fn push_frame(&self, pcm: &[i16], encoded: Vec<u8>) -> bool {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if !listeners.is_empty() {
            let frame: PcmFrame = Arc::from(pcm);
            for listener in &listeners {
                listener.push(Arc::clone(&frame));
            }
        }

        if !self.should_capture_audio() {
            return false;
        }
        match self.uplink.try_send(encoded) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.uplink_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(dropped, "uplink queue full, dropping frame");
                false
            }
        }
    }

    pub fn uplink_dropped(&self) -> u64 {
        self.uplink_dropped.load(Ordering::Relaxed)
    }
}
