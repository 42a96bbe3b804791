//! Guest audio bridging
//!
//! Carries the guest's playback audio to a host backend with adaptive
//! clock synchronization, and host capture audio back to the guest as a
//! straight pass-through.
//!
//! Pipeline (playback direction):
//!
//! ```text
//! guest packets ──> s16→f32 ──> adaptive resampler ──> frame ring ──> device pull
//!     (network thread)              ▲                                (RT thread)
//!                                   │            device ticks
//!                                   └──────── latency controller <───┘
//! ```

pub mod clock;
pub mod device;
pub mod engine;
pub mod playback;
pub mod record;
pub mod resampler;
pub mod ring;
pub mod types;

pub use engine::AudioEngine;
pub use playback::{LatencyCallback, LatencyReport, PlaybackStats, StreamState};
pub use record::RecordWriter;
pub use types::StreamFormat;
