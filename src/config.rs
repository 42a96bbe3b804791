//! Configuration
//!
//! [`AudioOptions`] is the engine's configuration, read once per stream
//! start. [`ProbeConfig`] is the TOML bootstrap configuration of the
//! `sync-probe` binary, with the usual file-then-CLI-override layering.

use crate::audio::playback::LatencyCallback;
use crate::audio::record::RecordWriter;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Engine configuration. Values are captured at stream start and held
/// constant for the life of that stream.
pub struct AudioOptions {
    /// Device period to request, in frames
    pub period_size: usize,

    /// Extra buffered latency on top of the device period, in milliseconds.
    /// The default absorbs typical virtualization timing jitter.
    pub buffer_latency_ms: u32,

    /// Playback device name hint; `None` uses the default sink
    pub sink: Option<String>,

    /// Capture device name hint; `None` uses the default source
    pub source: Option<String>,

    /// Invoked with a latency measurement after every guest packet
    pub latency_cb: Option<LatencyCallback>,

    /// Receives captured guest-bound packets
    pub record_writer: Option<RecordWriter>,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            period_size: 256,
            buffer_latency_ms: 12,
            sink: None,
            source: None,
            latency_cb: None,
            record_writer: None,
        }
    }
}

impl std::fmt::Debug for AudioOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioOptions")
            .field("period_size", &self.period_size)
            .field("buffer_latency_ms", &self.buffer_latency_ms)
            .field("sink", &self.sink)
            .field("source", &self.source)
            .field("latency_cb", &self.latency_cb.is_some())
            .field("record_writer", &self.record_writer.is_some())
            .finish()
    }
}

/// Bootstrap configuration of the probe binary, loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Playback device name hint
    #[serde(default)]
    pub sink: Option<String>,

    /// Capture device name hint
    #[serde(default)]
    pub source: Option<String>,

    /// Device period to request, in frames
    #[serde(default = "default_period_size")]
    pub period_size: usize,

    /// Extra buffered latency, in milliseconds
    #[serde(default = "default_buffer_latency_ms")]
    pub buffer_latency_ms: u32,
}

fn default_period_size() -> usize {
    256
}

fn default_buffer_latency_ms() -> u32 {
    12
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            sink: None,
            source: None,
            period_size: default_period_size(),
            buffer_latency_ms: default_buffer_latency_ms(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from a TOML file with optional command-line
    /// overrides. A missing `path` yields the defaults.
    pub fn load(
        path: Option<&Path>,
        sink_override: Option<String>,
        period_override: Option<usize>,
        latency_override: Option<u32>,
    ) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let toml_str = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                toml::from_str(&toml_str)
                    .map_err(|e| Error::Config(format!("failed to parse TOML: {}", e)))?
            }
            None => Self::default(),
        };

        if sink_override.is_some() {
            config.sink = sink_override;
        }
        if let Some(period) = period_override {
            config.period_size = period;
        }
        if let Some(latency) = latency_override {
            config.buffer_latency_ms = latency;
        }

        if config.period_size == 0 {
            return Err(Error::Config("period_size must be at least 1".into()));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let opts = AudioOptions::default();
        assert_eq!(opts.period_size, 256);
        assert_eq!(opts.buffer_latency_ms, 12);
        assert!(opts.sink.is_none());
    }

    #[test]
    fn test_probe_config_load_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sink = \"alsa_output.test\"\nperiod_size = 128").unwrap();

        let config = ProbeConfig::load(Some(file.path()), None, Some(512), Some(20)).unwrap();
        assert_eq!(config.sink.as_deref(), Some("alsa_output.test"));
        assert_eq!(config.period_size, 512); // override wins
        assert_eq!(config.buffer_latency_ms, 20);
    }

    #[test]
    fn test_probe_config_missing_file_is_error() {
        let result = ProbeConfig::load(Some(Path::new("/does/not/exist.toml")), None, None, None);
        assert!(result.is_err());
    }

    #[test]
    fn test_probe_config_rejects_zero_period() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "period_size = 0").unwrap();
        assert!(ProbeConfig::load(Some(file.path()), None, None, None).is_err());
    }
}
