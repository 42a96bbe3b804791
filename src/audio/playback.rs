//! Playback clock synchronization
//!
//! Guest packets arrive on the network thread at the guest's idea of the
//! sample rate; the host device pulls frames on its real-time thread at its
//! own, slightly different and wandering, rate. This module keeps the two
//! in lock-step with bounded latency:
//!
//! - each side runs a [`DllClock`] over its own event stream
//! - the device side publishes [`DeviceTick`] snapshots through a lock-free
//!   queue after every pull
//! - the guest side interpolates those ticks to estimate where the device
//!   is playing, filters the offset against a target latency, and feeds the
//!   result into a PI controller that steers the resampling ratio
//! - phase errors too large to resample away (or a restart out of
//!   keep-alive) are handled by slewing whole frames of silence in or out
//!   at the ring heads and resetting the integrators
//!
//! Stream lifecycle:
//!
//! ```text
//! Stop -> SetupGuest -> SetupDevice -> Run <-> KeepAlive -> Stop
//! ```
//!
//! `SetupGuest` waits for the first packet (which fixes the packet period
//! and the startup latency target), `SetupDevice` waits for the first
//! device pull (which prepends silence up to the target), and `KeepAlive`
//! holds the device open after a guest stop so a quick restart skips the
//! expensive device reopen. Thirty seconds of continuous underrun in
//! keep-alive flags the stream for teardown.
//!
//! Exactly two threads touch this state. The guest thread owns
//! [`PlaybackStream`]; the device thread owns the [`PullHandle`] captured
//! in the backend's pull callback. They share only the state flag, the tick
//! queue, and the ring's signed count.

use crate::audio::clock::{DeviceTick, DllClock, MAX_PHASE_ERROR_SEC};
use crate::audio::device::{AudioBackend, PullFn};
use crate::audio::resampler::AdaptiveResampler;
use crate::audio::ring::{self, RingReader, RingWriter};
use crate::audio::types::{self, StreamFormat};
use crate::config::AudioOptions;
use crate::error::Result;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Proportional gain of the ratio controller (frames of offset error to
/// fractional rate change).
const RATIO_KP: f64 = 0.5e-6;

/// Integral gain of the ratio controller.
const RATIO_KI: f64 = 1.0e-16;

/// Extra slew allowance when resuming out of keep-alive, covering the
/// converter's startup delay. Tied to the `FastFixedIn` kernel.
const RESAMPLER_WARMUP_FRAMES: f64 = 20.0;

/// Continuous underrun in keep-alive before the stream tears down.
const KEEP_ALIVE_STOP_SEC: i64 = 30;

/// Device ticks buffered between threads. Only the most recent two are
/// needed for interpolation; the queue drops its oldest entry on overflow.
const TICK_QUEUE_LEN: usize = 16;

/// Recent total-latency measurements kept for UI sampling.
const LATENCY_HISTORY_LEN: usize = 1200;

/// Lifecycle of the playback stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// No stream; no resources held
    Stop = 0,
    /// Resources allocated, waiting for the first guest packet
    SetupGuest = 1,
    /// Device armed, waiting for its first pull
    SetupDevice = 2,
    /// Steady state
    Run = 3,
    /// Guest stopped; device held open for a quick restart
    KeepAlive = 4,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::SetupGuest,
            2 => StreamState::SetupDevice,
            3 => StreamState::Run,
            4 => StreamState::KeepAlive,
            _ => StreamState::Stop,
        }
    }

    /// True in the states where the device is audible (volume and mute
    /// changes are forwarded immediately).
    pub fn is_active(self) -> bool {
        matches!(self, StreamState::Run | StreamState::KeepAlive)
    }
}

/// One latency measurement, emitted after every guest packet.
#[derive(Debug, Clone, Copy)]
pub struct LatencyReport {
    /// Frames queued between guest write and device read, in milliseconds
    pub current_offset_ms: f64,

    /// Latency reported by the device itself, in milliseconds (0 if the
    /// backend cannot tell)
    pub device_latency_ms: f64,

    /// Sum of the two
    pub total_latency_ms: f64,
}

/// Callback receiving a [`LatencyReport`] once per guest packet.
pub type LatencyCallback = Box<dyn FnMut(LatencyReport) + Send>;

/// Snapshot of the sync loop for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackStats {
    pub state: StreamState,
    /// Signed frame count of the playback ring
    pub buffered_frames: i64,
    /// Current target latency, in frames
    pub target_latency_frames: f64,
    /// Filtered offset error, in frames
    pub offset_error_frames: f64,
    /// Last ratio applied to the converter
    pub resample_ratio: f64,
    /// Slews performed since stream start
    pub slew_count: u64,
}

/// State shared between the guest and device threads.
struct PlaybackShared {
    state: AtomicU8,
    ticks: ArrayQueue<DeviceTick>,
    /// Frames that must be queued before audible playback starts; written
    /// by the guest thread while arming the device
    target_start_frames: AtomicI64,
    /// Underrun depth at which keep-alive gives up
    stop_after_frames: i64,
    channels: usize,
    sample_rate: u32,
}

impl PlaybackShared {
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Device-thread half: consumes the ring and models the device clock.
///
/// Captured into the backend's pull callback; wait-free on the hot path.
struct PullHandle {
    reader: RingReader,
    clock: CachePadded<DllClock>,
    shared: Arc<PlaybackShared>,
}

impl PullHandle {
    /// Fill `dst` with interleaved frames at monotonic time `now`.
    ///
    /// Always writes the whole buffer; returns 0 (silence written) once the
    /// stream has stopped so the backend can emit an empty chunk.
    fn pull(&mut self, now: i64, dst: &mut [f32]) -> usize {
        let channels = self.shared.channels;
        let frames = dst.len() / channels;
        if frames == 0 {
            return 0;
        }

        let state = self.shared.state();
        if state == StreamState::Stop {
            dst.fill(0.0);
            return 0;
        }

        if state == StreamState::SetupDevice {
            // If the device starts pulling before the startup target is
            // buffered, slew backwards so the gap plays as silence instead
            // of underrunning right out of the gate.
            let offset =
                self.reader.count() - self.shared.target_start_frames.load(Ordering::Acquire);
            if offset < 0 {
                self.clock.next_position += offset;
                self.reader.consume(None, offset);
            }
            self.shared.set_state(StreamState::Run);
            debug!(prebuffer_deficit = (-offset).max(0), "device pulling, stream running");
        }

        let rate = self.shared.sample_rate;
        let clock = &mut *self.clock;
        if frames != clock.period_frames {
            let init = clock.is_unset();
            if init {
                clock.set_period(frames, rate);
                clock.next_time = now + clock.period_ns();
            } else {
                // The device double-buffers: after a period change it still
                // plays out the previous buffer first, so the next wakeup is
                // one *old* period away. Advance before adopting the new
                // period.
                clock.next_time += clock.period_ns();
                clock.set_period(frames, rate);
            }
            clock.next_position += frames as i64;
        } else {
            let error = clock.phase_error_sec(now);
            if error.abs() >= MAX_PHASE_ERROR_SEC {
                // Too far gone to filter; jump the read head to match and
                // restart tracking from here.
                let slew = (error * f64::from(rate)).round() as i64;
                self.reader.consume(None, slew);
                clock.rebase(now, rate);
                clock.next_position += slew + frames as i64;
                debug!(error_sec = error, slew, "device clock slew");
            } else {
                clock.smooth_advance(error);
                clock.next_position += frames as i64;
            }
        }

        // Overflow drops the oldest tick; the guest side only needs the two
        // most recent for interpolation
        let _ = self.shared.ticks.force_push(DeviceTick {
            period_frames: clock.period_frames,
            next_time: clock.next_time,
            next_position: clock.next_position,
        });

        self.reader.consume(Some(dst), frames as i64);

        // A stream lingering in keep-alive runs the ring further and
        // further negative; give the device back after 30 seconds of that.
        if self.shared.state() == StreamState::KeepAlive
            && self.reader.count() <= -self.shared.stop_after_frames
        {
            self.shared.set_state(StreamState::Stop);
            debug!("keep-alive expired, flagging stream for teardown");
        }

        frames
    }
}

/// Guest-thread half: owns the converter, the controller, and the write
/// side of the ring.
pub(crate) struct PlaybackStream {
    shared: Arc<PlaybackShared>,
    writer: RingWriter,
    clock: CachePadded<DllClock>,
    format: StreamFormat,

    resampler: AdaptiveResampler,
    /// Converted packet, interleaved f32
    frames_in: Vec<f32>,
    /// Converter output staging, interleaved f32
    frames_out: Vec<f32>,

    device_max_period_frames: usize,
    device_start_frames: usize,

    /// Device clock view, rebuilt from the tick queue each packet:
    /// period of the latest tick plus the two most recent (time, position)
    /// pairs for interpolation
    dev_period_frames: usize,
    dev_last: Option<(i64, i64)>,
    dev_next: Option<(i64, i64)>,

    offset_error: f64,
    offset_error_integral: f64,
    ratio_integral: f64,
    ratio: f64,

    target_latency_frames: f64,
    slew_count: u64,

    timings: HeapRb<f32>,
    buffer_latency_ms: u32,
}

/// Allocate stream resources and open (but do not start) the device.
pub(crate) fn start_stream(
    format: StreamFormat,
    opts: &AudioOptions,
    backend: &mut dyn AudioBackend,
) -> Result<PlaybackStream> {
    let requested_period = opts.period_size.max(1);

    // The converter chunk must match the guest packet size, which is not
    // known until the first packet; it is rebuilt then if it differs.
    let resampler = AdaptiveResampler::new(format.channels, requested_period)?;

    // One second of buffered audio; the controller keeps the level near the
    // target latency, far below this.
    let (writer, reader) = ring::frame_ring(format.sample_rate as usize, format.channels);

    let shared = Arc::new(PlaybackShared {
        state: AtomicU8::new(StreamState::SetupGuest as u8),
        ticks: ArrayQueue::new(TICK_QUEUE_LEN),
        target_start_frames: AtomicI64::new(0),
        stop_after_frames: KEEP_ALIVE_STOP_SEC * i64::from(format.sample_rate),
        channels: format.channels,
        sample_rate: format.sample_rate,
    });

    let mut handle = PullHandle {
        reader,
        clock: CachePadded::new(DllClock::new()),
        shared: Arc::clone(&shared),
    };
    let pull: PullFn = Box::new(move |now, dst| handle.pull(now, dst));

    let params = backend.playback_setup(opts.sink.as_deref(), format, requested_period, pull)?;
    debug!(
        max_period_frames = params.max_period_frames,
        start_frames = params.start_frames,
        "playback device open"
    );

    Ok(PlaybackStream {
        shared,
        writer,
        clock: CachePadded::new(DllClock::new()),
        format,
        resampler,
        frames_in: Vec::new(),
        frames_out: Vec::new(),
        device_max_period_frames: params.max_period_frames,
        device_start_frames: params.start_frames,
        dev_period_frames: 0,
        dev_last: None,
        dev_next: None,
        offset_error: 0.0,
        offset_error_integral: 0.0,
        ratio_integral: 0.0,
        ratio: 1.0,
        target_latency_frames: 0.0,
        slew_count: 0,
        timings: HeapRb::new(LATENCY_HISTORY_LEN),
        buffer_latency_ms: opts.buffer_latency_ms,
    })
}

impl PlaybackStream {
    pub(crate) fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub(crate) fn format(&self) -> StreamFormat {
        self.format
    }

    /// Guest stopped while running: keep the device open for a while.
    pub(crate) fn enter_keep_alive(&mut self) {
        self.shared.set_state(StreamState::KeepAlive);
        // Clear filter state so the converter is safe for the next stream
        self.resampler.reset();
        debug!("playback entering keep-alive");
    }

    /// Flag the stream stopped and request a device drain. Resources are
    /// released when the stream value is dropped by the caller.
    pub(crate) fn shutdown(self, backend: &mut dyn AudioBackend) {
        self.shared.set_state(StreamState::Stop);
        backend.playback_stop();
        debug!("playback stream stopped");
    }

    pub(crate) fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            state: self.state(),
            buffered_frames: self.writer.count(),
            target_latency_frames: self.target_latency_frames,
            offset_error_frames: self.offset_error,
            resample_ratio: self.ratio,
            slew_count: self.slew_count,
        }
    }

    /// Recent total-latency measurements, oldest first, in milliseconds.
    pub(crate) fn latency_history(&self) -> Vec<f32> {
        use ringbuf::traits::Consumer;
        self.timings.iter().copied().collect()
    }

    /// Estimate the device playback position at time `t` by interpolating
    /// the two most recent device ticks.
    fn interpolate_device_position(&self, t: i64) -> Option<f64> {
        let (last_t, last_p) = self.dev_last?;
        let (next_t, next_p) = self.dev_next?;
        if next_t == last_t {
            return Some(next_p as f64);
        }
        Some(
            last_p as f64
                + (next_p - last_p) as f64 * ((t - last_t) as f64 / (next_t - last_t) as f64),
        )
    }

    /// Handle one guest PCM packet at monotonic time `now`.
    ///
    /// An `Err` is fatal for the stream (the caller tears it down); packet-
    /// local failures are logged and swallowed.
    pub(crate) fn handle_data(
        &mut self,
        now: i64,
        data: &[u8],
        backend: &mut dyn AudioBackend,
        latency_cb: &mut Option<LatencyCallback>,
    ) -> Result<()> {
        let state = self.shared.state();
        if state == StreamState::Stop || data.is_empty() {
            return Ok(());
        }

        let format = self.format;
        let rate = f64::from(format.sample_rate);
        let frames = format.guest_frames(data.len());
        if frames == 0 {
            return Ok(());
        }

        let period_changed = frames != self.clock.period_frames;
        let init = self.clock.is_unset();

        if period_changed {
            // The packet size fixes the converter chunk and scratch sizes
            if !init {
                debug!(
                    old = self.clock.period_frames,
                    new = frames,
                    "guest packet size changed"
                );
            }
            self.resampler = AdaptiveResampler::new(format.channels, frames)?;
            self.frames_in = Vec::with_capacity(frames * format.channels);
            self.frames_out =
                Vec::with_capacity((frames as f64 * 1.1).ceil() as usize * format.channels);
        }

        types::s16le_to_f32(&data[..frames * format.guest_stride()], &mut self.frames_in);

        // Catch up on device timing
        while let Some(tick) = self.shared.ticks.pop() {
            self.dev_period_frames = tick.period_frames;
            self.dev_last = self.dev_next;
            self.dev_next = Some((tick.next_time, tick.next_position));
        }

        // Target latency: the largest period the device can ask for, a
        // little headroom for timing jitter, and the configured cushion.
        let max_period = self.device_max_period_frames.max(self.dev_period_frames);
        let mut target =
            max_period as f64 * 1.1 + f64::from(self.buffer_latency_ms) * rate / 1000.0;

        // While the device runs a period smaller than its maximum, the
        // transition mechanics shift data out of the device buffer into our
        // ring: the pull uses the new (small) size but the wakeup interval
        // still reflects the old one. That surplus must not be chased away;
        // when the period grows back the device will suddenly demand it
        // again at the old interval and anything we "corrected" becomes an
        // underrun. Raising the target by the difference keeps the offset
        // error stable through both transitions.
        if self.dev_period_frames != 0 && self.dev_period_frames < self.device_max_period_frames {
            target += (self.device_max_period_frames - self.dev_period_frames) as f64;
        }
        self.target_latency_frames = target;

        // Measure the guest clock
        let cur_time;
        let cur_position;
        let mut dev_position: Option<f64> = None;
        if period_changed {
            if init {
                self.clock.next_time = now;
            }
            cur_time = self.clock.next_time;
            cur_position = self.clock.next_position;

            self.clock.set_period(frames, format.sample_rate);
            self.clock.next_time += self.clock.period_ns();
        } else {
            let error = self.clock.phase_error_sec(now);
            if error.abs() >= MAX_PHASE_ERROR_SEC || state == StreamState::KeepAlive {
                // Clock error too large, or a fresh stream reusing a
                // keep-alive device: slew the write head straight to the
                // target latency when the device position is known,
                // otherwise by the raw error.
                let slew_frames = if self.dev_last.is_some() {
                    let pos = self
                        .interpolate_device_position(now)
                        .expect("device window populated");
                    dev_position = Some(pos);
                    let mut target_position = pos + target;
                    if state == StreamState::KeepAlive {
                        target_position += RESAMPLER_WARMUP_FRAMES;
                    }
                    (target_position - self.clock.next_position as f64).round() as i64
                } else {
                    (error * rate).round() as i64
                };

                self.writer.append(None, slew_frames);

                cur_time = now;
                cur_position = self.clock.next_position + slew_frames;

                self.clock.rebase(now, format.sample_rate);
                self.clock.next_position = cur_position;

                self.offset_error = 0.0;
                self.offset_error_integral = 0.0;
                self.ratio_integral = 0.0;
                self.slew_count += 1;

                self.shared.set_state(StreamState::Run);
                debug!(error_sec = error, slew_frames, "guest clock slew");
            } else {
                cur_time = self.clock.next_time;
                cur_position = self.clock.next_position;
                self.clock.smooth_advance(error);
            }
        }

        // Offset between our write position and the device's interpolated
        // play position, filtered through the guest clock's loop gains so
        // startup transients do not turn into audible pitch bends.
        let mut actual_offset = 0.0;
        let offset_error = self.offset_error;
        if self.dev_last.is_some() {
            let dev_pos = match dev_position {
                Some(p) => p,
                None => self
                    .interpolate_device_position(cur_time)
                    .expect("device window populated"),
            };
            actual_offset = cur_position as f64 - dev_pos;
            let actual_offset_error = -(actual_offset - target);

            let err = actual_offset_error - offset_error;
            self.offset_error += self.clock.gain_b() * err + self.offset_error_integral;
            self.offset_error_integral += self.clock.gain_c() * err;
        }

        // PI controller on the conversion ratio
        self.ratio_integral += offset_error * self.clock.period_sec;
        let ratio = 1.0 + RATIO_KP * offset_error + RATIO_KI * self.ratio_integral;
        self.ratio = ratio;
        if let Err(e) = self.resampler.set_ratio(ratio) {
            warn!(error = %e, ratio, "failed to steer resampler ratio");
        }

        match self.resampler.process_into(&self.frames_in, &mut self.frames_out) {
            Ok(generated) => {
                self.writer.append(Some(&self.frames_out), generated as i64);
                self.clock.next_position += generated as i64;
            }
            Err(e) => {
                warn!(error = %e, frames, "resampling failed, dropping packet");
                return Ok(());
            }
        }

        if self.shared.state() == StreamState::SetupGuest {
            // Guest packet pacing is poor right after stream start, so
            // demand two full packets of cushion on top of whatever the
            // device wants before playback begins. The device is armed
            // immediately; if it starts pulling early the gap plays as
            // silence (see the pull side), if late we simply run at a
            // slightly higher latency until the controller trims it.
            let start_frames = (frames * 2 + self.device_start_frames) as i64;
            self.shared
                .target_start_frames
                .store(start_frames, Ordering::Release);
            self.shared.set_state(StreamState::SetupDevice);
            backend.playback_start();
            debug!(target_start_frames = start_frames, "arming playback device");
        }

        // Latency report
        let device_latency_frames = backend.playback_latency_frames() as f64;
        let current_offset_ms = actual_offset * 1000.0 / rate;
        let device_latency_ms = device_latency_frames * 1000.0 / rate;
        let total_latency_ms = current_offset_ms + device_latency_ms;

        {
            use ringbuf::traits::RingBuffer;
            self.timings.push_overwrite(total_latency_ms as f32);
        }
        if let Some(cb) = latency_cb.as_mut() {
            cb(LatencyReport {
                current_offset_ms,
                device_latency_ms,
                total_latency_ms,
            });
        }

        trace!(
            frames,
            ratio,
            offset = actual_offset,
            target,
            "guest packet processed"
        );

        Ok(())
    }
}
