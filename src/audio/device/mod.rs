//! Host sound-server backends
//!
//! The engine never talks to a sound server directly; it depends on the
//! capability set below. Three backends implement it:
//!
//! - [`cpal_backend::CpalBackend`] — the native host device
//! - [`null::NullBackend`] — no device at all, pumped manually (tests)
//! - [`wav::WavBackend`] — writes pulled audio to a wav file for offline
//!   analysis
//!
//! A playback backend is a pull consumer: once set up it owns a callback
//! that it invokes from its own real-time thread whenever it wants frames.
//! `setup` creates the stream inactive; `start` arms it; `stop` requests a
//! drain and deactivates; `close` tears the stream down. Record backends
//! push captured s16 packets through a callback instead.

pub mod cpal_backend;
pub mod null;
pub mod wav;

use crate::audio::types::StreamFormat;
use crate::error::Result;

/// Pull callback: fill `buf` (interleaved f32) at monotonic time `now_ns`,
/// returning the number of frames written. A return of 0 means the stream
/// has stopped and the backend should emit an empty chunk.
pub type PullFn = Box<dyn FnMut(i64, &mut [f32]) -> usize + Send>;

/// Capture callback: `bytes` holds `frames` interleaved s16le frames.
pub type CaptureFn = Box<dyn FnMut(&[u8], usize) + Send>;

/// Figures reported by playback setup.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackParams {
    /// Largest period the device is expected to request, in frames
    pub max_period_frames: usize,

    /// Frames the device may demand almost immediately at stream start
    pub start_frames: usize,
}

impl PlaybackParams {
    /// Default startup demand: two full periods, which a device coming off a
    /// very small quantum can request back to back.
    pub fn for_period(max_period_frames: usize) -> Self {
        Self {
            max_period_frames,
            start_frames: max_period_frames * 2,
        }
    }
}

/// Capability set of a host sound server.
pub trait AudioBackend {
    /// Create (or reuse) an inactive playback stream and install the pull
    /// callback. Reuse happens when a stream with the same format already
    /// exists; only the callback is swapped then.
    fn playback_setup(
        &mut self,
        sink: Option<&str>,
        format: StreamFormat,
        requested_period_frames: usize,
        pull: PullFn,
    ) -> Result<PlaybackParams>;

    /// Activate the playback stream. No-op while a previous drain is still
    /// in flight or if no stream exists.
    fn playback_start(&mut self);

    /// Request a drain and deactivate.
    fn playback_stop(&mut self);

    /// Tear the playback stream down entirely.
    fn playback_close(&mut self);

    /// Current device-side latency in frames; 0 when unknown.
    fn playback_latency_frames(&self) -> usize;

    /// Per-channel linear gains.
    fn playback_set_volume(&mut self, gains: &[f32]);

    fn playback_set_mute(&mut self, mute: bool);

    /// Start capturing from the host; captured s16 frames are pushed through
    /// `capture`. Reuses an existing stream with the same format.
    fn record_start(
        &mut self,
        source: Option<&str>,
        format: StreamFormat,
        capture: CaptureFn,
    ) -> Result<()>;

    fn record_stop(&mut self);

    fn record_set_volume(&mut self, gains: &[f32]);

    fn record_set_mute(&mut self, mute: bool);
}
