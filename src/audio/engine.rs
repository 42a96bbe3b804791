//! Audio engine handle
//!
//! One [`AudioEngine`] bridges the guest's audio channels to a host
//! backend. All methods are called from the network client's thread; the
//! backend's real-time thread only ever sees the pull callback installed at
//! stream setup. The methods map one-to-one onto the guest protocol's
//! playback/record callbacks and never return errors to the caller — a
//! broken stream is logged and torn down, and the next `playback_start`
//! simply tries again.

use crate::audio::device::AudioBackend;
use crate::audio::playback::{self, LatencyCallback, PlaybackStats, PlaybackStream, StreamState};
use crate::audio::record::RecordCtl;
use crate::audio::types::{self, StreamFormat, MAX_VOLUME_CHANNELS};
use crate::config::AudioOptions;
use tracing::{error, info};

/// Playback-side control state living across streams.
#[derive(Default)]
struct PlaybackCtl {
    stream: Option<PlaybackStream>,
    volume: Vec<u16>,
    mute: bool,
}

pub struct AudioEngine {
    opts: AudioOptions,
    backend: Box<dyn AudioBackend>,
    latency_cb: Option<LatencyCallback>,
    playback: PlaybackCtl,
    record: RecordCtl,
}

impl AudioEngine {
    pub fn new(mut opts: AudioOptions, backend: Box<dyn AudioBackend>) -> Self {
        let latency_cb = opts.latency_cb.take();
        Self {
            opts,
            backend,
            latency_cb,
            playback: PlaybackCtl::default(),
            record: RecordCtl::default(),
        }
    }

    /// Guest opened a playback stream.
    ///
    /// A start matching the format of a stream lingering in keep-alive
    /// reuses it wholesale; anything else tears down whatever exists and
    /// allocates fresh.
    pub fn playback_start(&mut self, channels: usize, sample_rate: u32) {
        self.reap_stopped_playback();

        let format = StreamFormat::new(channels, sample_rate);
        if let Some(stream) = &self.playback.stream {
            if stream.state() == StreamState::KeepAlive && stream.format() == format {
                return;
            }
            self.playback_teardown();
        }

        match playback::start_stream(format, &self.opts, self.backend.as_mut()) {
            Ok(stream) => {
                self.playback.stream = Some(stream);
                // Control state received before the device existed
                if !self.playback.volume.is_empty() {
                    self.backend
                        .playback_set_volume(&types::guest_volumes_to_gains(&self.playback.volume));
                }
                self.backend.playback_set_mute(self.playback.mute);
                info!(channels, sample_rate, "playback stream created");
            }
            Err(e) => {
                error!(error = %e, "failed to create playback stream");
            }
        }
    }

    /// Guest closed its playback stream.
    ///
    /// A running stream lingers in keep-alive so a quick restart avoids the
    /// device reopen; a stream still setting up is torn down outright.
    pub fn playback_stop(&mut self) {
        self.reap_stopped_playback();

        let Some(stream) = self.playback.stream.as_mut() else {
            return;
        };
        match stream.state() {
            StreamState::Run => stream.enter_keep_alive(),
            StreamState::SetupGuest | StreamState::SetupDevice => self.playback_teardown(),
            StreamState::KeepAlive | StreamState::Stop => {}
        }
    }

    /// Guest PCM packet (tightly packed s16le frames).
    pub fn playback_data(&mut self, data: &[u8]) {
        self.playback_data_at(crate::audio::clock::nanotime(), data);
    }

    /// As [`Self::playback_data`] with an explicit monotonic timestamp.
    pub fn playback_data_at(&mut self, now_ns: i64, data: &[u8]) {
        self.reap_stopped_playback();

        let Some(stream) = self.playback.stream.as_mut() else {
            return;
        };
        if let Err(e) =
            stream.handle_data(now_ns, data, self.backend.as_mut(), &mut self.latency_cb)
        {
            error!(error = %e, "playback stream failed, stopping");
            self.playback_teardown();
        }
    }

    /// Guest playback volume (logarithmic u16 per channel). Stored for
    /// replay across stream restarts; forwarded only while audible.
    pub fn playback_volume(&mut self, volumes: &[u16]) {
        self.playback.volume = volumes
            .iter()
            .copied()
            .take(MAX_VOLUME_CHANNELS)
            .collect();

        if !self.playback_state().is_active() {
            return;
        }
        self.backend
            .playback_set_volume(&types::guest_volumes_to_gains(&self.playback.volume));
    }

    pub fn playback_mute(&mut self, mute: bool) {
        self.playback.mute = mute;
        if !self.playback_state().is_active() {
            return;
        }
        self.backend.playback_set_mute(mute);
    }

    /// Guest opened its record (host microphone) stream.
    pub fn record_start(&mut self, channels: usize, sample_rate: u32) {
        let format = StreamFormat::new(channels, sample_rate);
        self.record.start(
            format,
            self.opts.source.as_deref(),
            self.opts.record_writer.clone(),
            self.backend.as_mut(),
        );
    }

    pub fn record_stop(&mut self) {
        self.record.stop(self.backend.as_mut());
    }

    /// Guest record volume, same scale as playback volume.
    pub fn record_volume(&mut self, volumes: &[u16]) {
        self.record.set_volume(volumes, self.backend.as_mut());
    }

    pub fn record_mute(&mut self, mute: bool) {
        self.record.set_mute(mute, self.backend.as_mut());
    }

    /// Current playback lifecycle state.
    pub fn playback_state(&self) -> StreamState {
        self.playback
            .stream
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(StreamState::Stop)
    }

    /// Sync-loop diagnostics; `None` when no stream exists.
    pub fn playback_stats(&self) -> Option<PlaybackStats> {
        self.playback.stream.as_ref().map(|s| s.stats())
    }

    /// Recent total-latency measurements in milliseconds, oldest first.
    pub fn latency_history(&self) -> Vec<f32> {
        self.playback
            .stream
            .as_ref()
            .map(|s| s.latency_history())
            .unwrap_or_default()
    }

    /// Immediate stop of both directions and release of the backend
    /// streams. Also performed on drop.
    pub fn free(mut self) {
        self.release();
    }

    /// The device thread flags a keep-alive stream `Stop` when it expires;
    /// resources are reclaimed here, on the next engine call.
    fn reap_stopped_playback(&mut self) {
        if self
            .playback
            .stream
            .as_ref()
            .is_some_and(|s| s.state() == StreamState::Stop)
        {
            self.playback_teardown();
        }
    }

    fn playback_teardown(&mut self) {
        if let Some(stream) = self.playback.stream.take() {
            stream.shutdown(self.backend.as_mut());
        }
    }

    fn release(&mut self) {
        self.playback_teardown();
        self.record.stop(self.backend.as_mut());
        self.backend.playback_close();
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.release();
    }
}
