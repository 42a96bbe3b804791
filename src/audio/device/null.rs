//! Null backend: no host device, pumped by hand
//!
//! Stands in for a sound server in tests and offline runs. The "device
//! thread" is whoever calls [`NullHandle::pull`]; everything else is
//! bookkeeping so tests can assert on stream lifecycle and captured control
//! values.

use super::{AudioBackend, CaptureFn, PlaybackParams, PullFn};
use crate::audio::types::StreamFormat;
use crate::error::Result;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct NullInner {
    pull: Option<PullFn>,
    capture: Option<CaptureFn>,
    playback_format: Option<StreamFormat>,
    record_format: Option<StreamFormat>,
    playback_active: bool,
    record_active: bool,
    playback_gains: Vec<f32>,
    playback_mute: bool,
    record_gains: Vec<f32>,
    record_mute: bool,
    latency_frames: usize,
    setup_count: usize,
}

/// Backend half, handed to the engine.
pub struct NullBackend {
    inner: Arc<Mutex<NullInner>>,
    max_period_frames: Option<usize>,
}

/// Test half: pumps the pull callback and inspects state.
#[derive(Clone)]
pub struct NullHandle {
    inner: Arc<Mutex<NullInner>>,
}

impl NullBackend {
    pub fn new() -> (Self, NullHandle) {
        let inner = Arc::new(Mutex::new(NullInner::default()));
        (
            Self {
                inner: Arc::clone(&inner),
                max_period_frames: None,
            },
            NullHandle { inner },
        )
    }

    /// Override the maximum period reported by setup (defaults to the
    /// requested period).
    pub fn with_max_period(mut self, frames: usize) -> Self {
        self.max_period_frames = Some(frames);
        self
    }
}

impl AudioBackend for NullBackend {
    fn playback_setup(
        &mut self,
        _sink: Option<&str>,
        format: StreamFormat,
        requested_period_frames: usize,
        pull: PullFn,
    ) -> Result<PlaybackParams> {
        let mut inner = self.inner.lock().unwrap();
        inner.pull = Some(pull);
        inner.playback_format = Some(format);
        inner.playback_active = false;
        inner.setup_count += 1;

        let max_period = self.max_period_frames.unwrap_or(requested_period_frames);
        Ok(PlaybackParams::for_period(max_period))
    }

    fn playback_start(&mut self) {
        self.inner.lock().unwrap().playback_active = true;
    }

    fn playback_stop(&mut self) {
        self.inner.lock().unwrap().playback_active = false;
    }

    fn playback_close(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pull = None;
        inner.playback_format = None;
        inner.playback_active = false;
    }

    fn playback_latency_frames(&self) -> usize {
        self.inner.lock().unwrap().latency_frames
    }

    fn playback_set_volume(&mut self, gains: &[f32]) {
        self.inner.lock().unwrap().playback_gains = gains.to_vec();
    }

    fn playback_set_mute(&mut self, mute: bool) {
        self.inner.lock().unwrap().playback_mute = mute;
    }

    fn record_start(
        &mut self,
        _source: Option<&str>,
        format: StreamFormat,
        capture: CaptureFn,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.capture = Some(capture);
        inner.record_format = Some(format);
        inner.record_active = true;
        Ok(())
    }

    fn record_stop(&mut self) {
        self.inner.lock().unwrap().record_active = false;
    }

    fn record_set_volume(&mut self, gains: &[f32]) {
        self.inner.lock().unwrap().record_gains = gains.to_vec();
    }

    fn record_set_mute(&mut self, mute: bool) {
        self.inner.lock().unwrap().record_mute = mute;
    }
}

impl NullHandle {
    /// Invoke the pull callback for `frames` frames at synthetic time
    /// `now_ns`. Returns `(buffer, frames_written)`; the buffer always holds
    /// `frames` frames (silence when the stream reported nothing).
    pub fn pull(&self, now_ns: i64, frames: usize) -> (Vec<f32>, usize) {
        let mut inner = self.inner.lock().unwrap();
        let channels = inner
            .playback_format
            .map(|f| f.channels)
            .unwrap_or(2);
        let mut buf = vec![0.0f32; frames * channels];
        let written = match inner.pull.as_mut() {
            Some(pull) => pull(now_ns, &mut buf),
            None => 0,
        };
        (buf, written)
    }

    /// Push a synthetic captured packet through the capture callback.
    pub fn feed_capture(&self, bytes: &[u8], frames: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.record_active {
            if let Some(capture) = inner.capture.as_mut() {
                capture(bytes, frames);
            }
        }
    }

    /// Pretend the device reports this much internal latency.
    pub fn set_latency_frames(&self, frames: usize) {
        self.inner.lock().unwrap().latency_frames = frames;
    }

    pub fn is_playback_active(&self) -> bool {
        self.inner.lock().unwrap().playback_active
    }

    pub fn is_playback_open(&self) -> bool {
        self.inner.lock().unwrap().pull.is_some()
    }

    pub fn is_record_active(&self) -> bool {
        self.inner.lock().unwrap().record_active
    }

    pub fn playback_gains(&self) -> Vec<f32> {
        self.inner.lock().unwrap().playback_gains.clone()
    }

    pub fn playback_muted(&self) -> bool {
        self.inner.lock().unwrap().playback_mute
    }

    pub fn record_gains(&self) -> Vec<f32> {
        self.inner.lock().unwrap().record_gains.clone()
    }

    /// How many times a playback stream has been (re)created.
    pub fn setup_count(&self) -> usize {
        self.inner.lock().unwrap().setup_count
    }
}
