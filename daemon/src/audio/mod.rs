//! Audio boundary: capture hand-off and playback queue
//!
//! Encoding, decoding and device I/O live outside this crate. They meet the
//! session through [`CaptureHandle`] and [`PlaybackQueue`].

mod capture;
mod playback;
mod source;

pub use capture::{CaptureHandle, FrameQueue};
pub use playback::{AudioModule, PlaybackQueue};
pub use source::CaptureModule;
