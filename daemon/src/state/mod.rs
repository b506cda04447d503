//! Session state shared between the orchestrator and its modules
//!
//! Provides the device state machine values:
//! - Idle: Connected or not, waiting for a wake phrase or command
//! - Listening: Microphone audio is streamed to the backend
//! - Speaking: The backend is playing a reply

mod session;

pub use session::{DeviceState, ListeningMode, Session};
