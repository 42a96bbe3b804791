//! Phase-locked clock models for the playback sync loop
//!
//! Two rate estimators drive the playback engine: one tracks the cadence of
//! guest packets arriving over the network, the other tracks the host
//! device's pull callbacks. Both are instances of the same second-order
//! digital PLL (`DllClock`): each event updates a predicted next event time
//! and a running period estimate, so short-term jitter is filtered out while
//! genuine rate drift is tracked.
//!
//! The loop gains are derived from the loop bandwidth `B`:
//!
//! ```text
//! omega = 2*pi*B*period
//! b = sqrt(2)*omega      (proportional)
//! c = omega^2            (integral)
//! ```
//!
//! The device side publishes a [`DeviceTick`] snapshot after every pull; the
//! guest side consumes those ticks to interpolate the device position.

use std::sync::OnceLock;
use std::time::Instant;

/// Loop bandwidth of both clock models, in Hz.
pub const LOOP_BANDWIDTH_HZ: f64 = 0.05;

/// Phase error at which tracking gives up and the stream slews instead, in
/// seconds.
pub const MAX_PHASE_ERROR_SEC: f64 = 0.2;

/// Monotonic timestamp in nanoseconds since an arbitrary process epoch.
pub fn nanotime() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as i64
}

/// Snapshot of the device clock, published to the guest thread once per
/// device pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTick {
    /// Period of the pull that produced this tick, in frames
    pub period_frames: usize,

    /// Predicted time of the next pull, in nanoseconds
    pub next_time: i64,

    /// Stream position after the pull, in frames
    pub next_position: i64,
}

/// Second-order PLL tracking an event stream against the monotonic clock.
///
/// The engine holds two instances, one per side, on separate cache lines.
/// A clock starts unset (`period_frames == 0`) and is configured by the
/// first event it sees.
#[derive(Debug, Clone, Copy, Default)]
pub struct DllClock {
    /// Frames delivered per event; 0 until the first event
    pub period_frames: usize,

    /// Filtered event period estimate, in seconds
    pub period_sec: f64,

    /// Predicted time of the next event, in nanoseconds
    pub next_time: i64,

    /// Stream position after the predicted next event, in frames
    pub next_position: i64,

    b: f64,
    c: f64,
}

impl DllClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until the first event configures the period.
    pub fn is_unset(&self) -> bool {
        self.period_frames == 0
    }

    /// Proportional loop gain for the current period.
    pub fn gain_b(&self) -> f64 {
        self.b
    }

    /// Integral loop gain for the current period.
    pub fn gain_c(&self) -> f64 {
        self.c
    }

    /// The current period estimate, in nanoseconds.
    pub fn period_ns(&self) -> i64 {
        (self.period_sec * 1.0e9).round() as i64
    }

    /// Configure the period and recompute the loop gains.
    pub fn set_period(&mut self, frames: usize, sample_rate: u32) {
        self.period_frames = frames;
        self.period_sec = frames as f64 / f64::from(sample_rate);

        let omega = 2.0 * std::f64::consts::PI * LOOP_BANDWIDTH_HZ * self.period_sec;
        self.b = std::f64::consts::SQRT_2 * omega;
        self.c = omega * omega;
    }

    /// Phase error of an event at `now` against the prediction, in seconds.
    /// Positive means the event arrived late.
    pub fn phase_error_sec(&self, now: i64) -> f64 {
        (now - self.next_time) as f64 * 1.0e-9
    }

    /// Feed one in-band phase error into the loop: advance the predicted
    /// next time by one (error-corrected) period and trim the period
    /// estimate.
    pub fn smooth_advance(&mut self, error: f64) {
        self.next_time += ((self.b * error + self.period_sec) * 1.0e9).round() as i64;
        self.period_sec += self.c * error;
    }

    /// Re-base the prediction after a slew: the next event is expected one
    /// nominal period from `now`. Resets accumulated period drift to the
    /// nominal value for the current period size.
    pub fn rebase(&mut self, now: i64, sample_rate: u32) {
        self.period_sec = self.period_frames as f64 / f64::from(sample_rate);
        self.next_time = now + self.period_ns();
    }
}
