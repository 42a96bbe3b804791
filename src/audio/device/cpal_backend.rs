//! Native host audio via cpal
//!
//! Playback is a pull stream: cpal's real-time callback asks for a buffer
//! and we fill it from the engine's pull callback, apply the guest's
//! channel gains, and hand it back. The stream is built inactive and only
//! starts once the engine arms it, so opening the device early costs
//! nothing audible.
//!
//! cpal has no server-side volume or latency query, so both are handled
//! here: gains are applied in the callback, and latency is estimated from
//! the callback-to-playback timestamp gap cpal reports.

use super::{AudioBackend, CaptureFn, PlaybackParams, PullFn};
use crate::audio::clock::nanotime;
use crate::audio::types::StreamFormat;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Shared per-direction gain state, applied on the audio thread.
#[derive(Default)]
struct GainState {
    gains: Mutex<Vec<f32>>,
    mute: AtomicBool,
}

impl GainState {
    fn apply_f32(&self, data: &mut [f32], channels: usize) {
        if self.mute.load(Ordering::Relaxed) {
            data.fill(0.0);
            return;
        }
        let gains = self.gains.lock().unwrap();
        if gains.is_empty() {
            return;
        }
        for (i, sample) in data.iter_mut().enumerate() {
            *sample *= gains[i % channels.min(gains.len())];
        }
    }

    fn apply_i16(&self, data: &mut [i16], channels: usize) {
        if self.mute.load(Ordering::Relaxed) {
            data.fill(0);
            return;
        }
        let gains = self.gains.lock().unwrap();
        if gains.is_empty() {
            return;
        }
        for (i, sample) in data.iter_mut().enumerate() {
            let g = gains[i % channels.min(gains.len())];
            *sample = (f32::from(*sample) * g) as i16;
        }
    }
}

struct PlaybackSide {
    stream: Stream,
    format: StreamFormat,
    pull_slot: Arc<Mutex<Option<PullFn>>>,
    latency_frames: Arc<AtomicUsize>,
    params: PlaybackParams,
    active: bool,
}

struct RecordSide {
    stream: Stream,
    format: StreamFormat,
    capture_slot: Arc<Mutex<Option<CaptureFn>>>,
    active: bool,
}

pub struct CpalBackend {
    host: cpal::Host,
    playback: Option<PlaybackSide>,
    record: Option<RecordSide>,
    playback_gain: Arc<GainState>,
    record_gain: Arc<GainState>,
}

impl CpalBackend {
    /// Connect to the default host and verify an output device exists.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        if host.default_output_device().is_none() {
            return Err(Error::Device("no default output device".into()));
        }
        info!(host = ?host.id(), "audio host initialized");
        Ok(Self {
            host,
            playback: None,
            record: None,
            playback_gain: Arc::new(GainState::default()),
            record_gain: Arc::new(GainState::default()),
        })
    }

    fn find_output_device(&self, name: Option<&str>) -> Result<Device> {
        match name {
            Some(name) => self
                .host
                .output_devices()
                .map_err(|e| Error::Device(format!("failed to enumerate devices: {}", e)))?
                .find(|d| d.name().ok().as_deref() == Some(name))
                .ok_or_else(|| Error::Device(format!("output device '{}' not found", name))),
            None => self
                .host
                .default_output_device()
                .ok_or_else(|| Error::Device("no default output device".into())),
        }
    }

    fn find_input_device(&self, name: Option<&str>) -> Result<Device> {
        match name {
            Some(name) => self
                .host
                .input_devices()
                .map_err(|e| Error::Device(format!("failed to enumerate devices: {}", e)))?
                .find(|d| d.name().ok().as_deref() == Some(name))
                .ok_or_else(|| Error::Device(format!("input device '{}' not found", name))),
            None => self
                .host
                .default_input_device()
                .ok_or_else(|| Error::Device("no default input device".into())),
        }
    }

    fn build_playback_stream(
        &self,
        device: &Device,
        format: StreamFormat,
        requested_period_frames: usize,
        pull_slot: Arc<Mutex<Option<PullFn>>>,
        latency_frames: Arc<AtomicUsize>,
    ) -> Result<Stream> {
        let channels = format.channels;
        let rate = f64::from(format.sample_rate);
        let gain = Arc::clone(&self.playback_gain);

        let data_cb = move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
            let ts = info.timestamp();
            if let Some(delay) = ts.playback.duration_since(&ts.callback) {
                latency_frames.store((delay.as_secs_f64() * rate) as usize, Ordering::Relaxed);
            }

            let written = {
                let mut slot = pull_slot.lock().unwrap();
                match slot.as_mut() {
                    Some(pull) => pull(nanotime(), data),
                    None => 0,
                }
            };
            data[written * channels..].fill(0.0);
            gain.apply_f32(data, channels);
        };
        let err_cb = |e| warn!(error = %e, "playback stream error");

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Fixed(requested_period_frames as u32),
        };

        // Not every device honors a fixed buffer size; fall back to the
        // device default and let the sync loop track whatever period shows
        // up.
        match device.build_output_stream(&config, data_cb.clone(), err_cb, None) {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!(error = %e, requested_period_frames, "fixed period rejected, using device default");
                let config = StreamConfig {
                    buffer_size: BufferSize::Default,
                    ..config
                };
                device
                    .build_output_stream(&config, data_cb, err_cb, None)
                    .map_err(|e| Error::Device(format!("failed to build output stream: {}", e)))
            }
        }
    }
}

impl AudioBackend for CpalBackend {
    fn playback_setup(
        &mut self,
        sink: Option<&str>,
        format: StreamFormat,
        requested_period_frames: usize,
        pull: PullFn,
    ) -> Result<PlaybackParams> {
        // Same format: keep the stream, swap in the new pull callback
        if let Some(side) = &self.playback {
            if side.format == format {
                *side.pull_slot.lock().unwrap() = Some(pull);
                return Ok(side.params);
            }
        }
        self.playback = None;

        let device = self.find_output_device(sink)?;
        info!(
            device = device.name().unwrap_or_else(|_| "unknown".into()),
            channels = format.channels,
            sample_rate = format.sample_rate,
            "opening playback device"
        );

        let pull_slot = Arc::new(Mutex::new(Some(pull)));
        let latency_frames = Arc::new(AtomicUsize::new(0));
        let stream = self.build_playback_stream(
            &device,
            format,
            requested_period_frames,
            Arc::clone(&pull_slot),
            Arc::clone(&latency_frames),
        )?;

        // Streams may come up running on some hosts; hold it until armed
        if let Err(e) = stream.pause() {
            debug!(error = %e, "could not pause freshly built stream");
        }

        let params = PlaybackParams::for_period(requested_period_frames);
        self.playback = Some(PlaybackSide {
            stream,
            format,
            pull_slot,
            latency_frames,
            params,
            active: false,
        });
        Ok(params)
    }

    fn playback_start(&mut self) {
        if let Some(side) = &mut self.playback {
            if !side.active {
                match side.stream.play() {
                    Ok(()) => side.active = true,
                    Err(e) => warn!(error = %e, "failed to start playback stream"),
                }
            }
        }
    }

    fn playback_stop(&mut self) {
        if let Some(side) = &mut self.playback {
            if side.active {
                if let Err(e) = side.stream.pause() {
                    warn!(error = %e, "failed to pause playback stream");
                }
                side.active = false;
            }
        }
    }

    fn playback_close(&mut self) {
        self.playback = None;
    }

    fn playback_latency_frames(&self) -> usize {
        self.playback
            .as_ref()
            .map(|side| side.latency_frames.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn playback_set_volume(&mut self, gains: &[f32]) {
        *self.playback_gain.gains.lock().unwrap() = gains.to_vec();
    }

    fn playback_set_mute(&mut self, mute: bool) {
        self.playback_gain.mute.store(mute, Ordering::Relaxed);
    }

    fn record_start(
        &mut self,
        source: Option<&str>,
        format: StreamFormat,
        capture: CaptureFn,
    ) -> Result<()> {
        if let Some(side) = &mut self.record {
            if side.format == format {
                *side.capture_slot.lock().unwrap() = Some(capture);
                if !side.active {
                    side.stream
                        .play()
                        .map_err(|e| Error::Device(format!("failed to resume capture: {}", e)))?;
                    side.active = true;
                }
                return Ok(());
            }
        }
        self.record = None;

        let device = self.find_input_device(source)?;
        info!(
            device = device.name().unwrap_or_else(|_| "unknown".into()),
            channels = format.channels,
            sample_rate = format.sample_rate,
            "opening capture device"
        );

        let capture_slot = Arc::new(Mutex::new(Some(capture)));
        let slot = Arc::clone(&capture_slot);
        let gain = Arc::clone(&self.record_gain);
        let channels = format.channels;

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        // The guest consumes s16; capture in f32 (universally supported)
        // and convert while packing.
        let mut packed: Vec<i16> = Vec::new();
        let mut bytes: Vec<u8> = Vec::new();
        let data_cb = move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let frames = data.len() / channels;
            packed.clear();
            packed.extend(
                data.iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
            );
            gain.apply_i16(&mut packed, channels);

            bytes.clear();
            for s in &packed {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
            if let Some(capture) = slot.lock().unwrap().as_mut() {
                capture(&bytes, frames);
            }
        };
        let err_cb = |e| warn!(error = %e, "capture stream error");

        let stream = device
            .build_input_stream(&config, data_cb, err_cb, None)
            .map_err(|e| Error::Device(format!("failed to build input stream: {}", e)))?;
        stream
            .play()
            .map_err(|e| Error::Device(format!("failed to start capture: {}", e)))?;

        self.record = Some(RecordSide {
            stream,
            format,
            capture_slot,
            active: true,
        });
        Ok(())
    }

    fn record_stop(&mut self) {
        if let Some(side) = &mut self.record {
            if side.active {
                if let Err(e) = side.stream.pause() {
                    warn!(error = %e, "failed to pause capture stream");
                }
                side.active = false;
            }
        }
    }

    fn record_set_volume(&mut self, gains: &[f32]) {
        *self.record_gain.gains.lock().unwrap() = gains.to_vec();
    }

    fn record_set_mute(&mut self, mute: bool) {
        self.record_gain.mute.store(mute, Ordering::Relaxed);
    }
}
