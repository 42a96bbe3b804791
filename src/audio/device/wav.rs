//! File-writing backend for offline analysis
//!
//! Behaves like a sound server with a perfectly regular clock: a worker
//! thread pulls one period every period interval and appends the frames to
//! a wav file. Useful for inspecting the sync loop's output without a
//! sound card, and as the offline mode of the probe binary.

use super::{AudioBackend, CaptureFn, PlaybackParams, PullFn};
use crate::audio::clock::nanotime;
use crate::audio::types::StreamFormat;
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

struct WavShared {
    pull: Mutex<Option<PullFn>>,
    running: AtomicBool,
}

pub struct WavBackend {
    path: PathBuf,
    format: Option<StreamFormat>,
    period_frames: usize,
    shared: Arc<WavShared>,
    writer: Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>>,
    worker: Option<JoinHandle<()>>,
    gains: Vec<f32>,
    mute: bool,
}

impl WavBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: None,
            period_frames: 0,
            shared: Arc::new(WavShared {
                pull: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            writer: None,
            worker: None,
            gains: Vec::new(),
            mute: false,
        }
    }

    fn stop_worker(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl AudioBackend for WavBackend {
    fn playback_setup(
        &mut self,
        _sink: Option<&str>,
        format: StreamFormat,
        requested_period_frames: usize,
        pull: PullFn,
    ) -> Result<PlaybackParams> {
        if self.format == Some(format) && self.writer.is_some() {
            *self.shared.pull.lock().unwrap() = Some(pull);
            return Ok(PlaybackParams::for_period(self.period_frames));
        }

        self.stop_worker();
        let spec = hound::WavSpec {
            channels: format.channels as u16,
            sample_rate: format.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(&self.path, spec)
            .map_err(|e| Error::Device(format!("failed to create {}: {}", self.path.display(), e)))?;

        self.writer = Some(writer);
        self.format = Some(format);
        self.period_frames = requested_period_frames;
        *self.shared.pull.lock().unwrap() = Some(pull);

        debug!(path = %self.path.display(), "wav sink open");
        Ok(PlaybackParams::for_period(requested_period_frames))
    }

    fn playback_start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let Some(format) = self.format else { return };
        let Some(mut writer) = self.writer.take() else {
            return;
        };

        let shared = Arc::clone(&self.shared);
        let frames = self.period_frames;
        let channels = format.channels;
        let period = Duration::from_secs_f64(frames as f64 / f64::from(format.sample_rate));
        let gains = self.gains.clone();
        let mute = self.mute;

        shared.running.store(true, Ordering::Release);
        self.worker = Some(std::thread::spawn(move || {
            let mut buf = vec![0.0f32; frames * channels];
            while shared.running.load(Ordering::Acquire) {
                std::thread::sleep(period);

                let written = {
                    let mut slot = shared.pull.lock().unwrap();
                    match slot.as_mut() {
                        Some(pull) => pull(nanotime(), &mut buf),
                        None => 0,
                    }
                };
                buf[written * channels..].fill(0.0);

                for (i, &sample) in buf.iter().enumerate() {
                    let mut s = sample;
                    if mute {
                        s = 0.0;
                    } else if !gains.is_empty() {
                        s *= gains[i % channels.min(gains.len())];
                    }
                    if let Err(e) = writer.write_sample(s) {
                        warn!(error = %e, "wav write failed");
                        shared.running.store(false, Ordering::Release);
                        break;
                    }
                }
            }
            if let Err(e) = writer.finalize() {
                warn!(error = %e, "failed to finalize wav file");
            }
        }));
    }

    fn playback_stop(&mut self) {
        self.stop_worker();
    }

    fn playback_close(&mut self) {
        self.stop_worker();
        // An unstarted writer still needs its header finalized
        if let Some(writer) = self.writer.take() {
            let _ = writer.finalize();
        }
        self.format = None;
        *self.shared.pull.lock().unwrap() = None;
    }

    fn playback_latency_frames(&self) -> usize {
        0
    }

    fn playback_set_volume(&mut self, gains: &[f32]) {
        self.gains = gains.to_vec();
    }

    fn playback_set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    fn record_start(
        &mut self,
        _source: Option<&str>,
        _format: StreamFormat,
        _capture: CaptureFn,
    ) -> Result<()> {
        Err(Error::Device("wav backend has no capture side".into()))
    }

    fn record_stop(&mut self) {}

    fn record_set_volume(&mut self, _gains: &[f32]) {}

    fn record_set_mute(&mut self, _mute: bool) {}
}

impl Drop for WavBackend {
    fn drop(&mut self) {
        self.playback_close();
    }
}
