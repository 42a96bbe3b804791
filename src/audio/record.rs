//! Record pass-through
//!
//! The capture direction has none of the playback path's clock problems:
//! the host device produces s16 frames and the guest accepts them at
//! whatever pace they arrive, so this is plumbing only. What it does keep
//! is restart state: volume and mute arrive from the guest before the
//! capture stream exists and must be replayed whenever it is (re)opened,
//! and a start with a changed format tears the old stream down first.

use crate::audio::device::AudioBackend;
use crate::audio::types::{self, StreamFormat, MAX_VOLUME_CHANNELS};
use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, error};

/// Sink for captured guest-bound packets (s16le bytes), typically the
/// network client's audio writer.
pub type RecordWriter = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
pub(crate) struct RecordCtl {
    started: bool,
    volume: Vec<u16>,
    mute: bool,
    last_format: Option<StreamFormat>,
}

impl RecordCtl {
    pub(crate) fn start(
        &mut self,
        format: StreamFormat,
        source: Option<&str>,
        writer: Option<RecordWriter>,
        backend: &mut dyn AudioBackend,
    ) {
        if self.started {
            if self.last_format == Some(format) {
                return;
            }
            backend.record_stop();
        }
        self.last_format = Some(format);

        if let Err(e) = self.open(format, source, writer, backend) {
            error!(error = %e, "failed to start capture stream");
        }
    }

    fn open(
        &mut self,
        format: StreamFormat,
        source: Option<&str>,
        writer: Option<RecordWriter>,
        backend: &mut dyn AudioBackend,
    ) -> Result<()> {
        let capture = Box::new(move |bytes: &[u8], _frames: usize| {
            if let Some(writer) = writer.as_ref() {
                writer(bytes);
            }
        });
        backend.record_start(source, format, capture)?;
        self.started = true;

        // Replay control state received while the stream was closed
        if !self.volume.is_empty() {
            backend.record_set_volume(&types::guest_volumes_to_gains(&self.volume));
        }
        backend.record_set_mute(self.mute);

        debug!(
            channels = format.channels,
            sample_rate = format.sample_rate,
            "capture stream started"
        );
        Ok(())
    }

    pub(crate) fn stop(&mut self, backend: &mut dyn AudioBackend) {
        if !self.started {
            return;
        }
        backend.record_stop();
        self.started = false;
        debug!("capture stream stopped");
    }

    pub(crate) fn set_volume(&mut self, volumes: &[u16], backend: &mut dyn AudioBackend) {
        self.volume = volumes.iter().copied().take(MAX_VOLUME_CHANNELS).collect();
        if !self.started {
            return;
        }
        backend.record_set_volume(&types::guest_volumes_to_gains(&self.volume));
    }

    pub(crate) fn set_mute(&mut self, mute: bool, backend: &mut dyn AudioBackend) {
        self.mute = mute;
        if !self.started {
            return;
        }
        backend.record_set_mute(mute);
    }
}
