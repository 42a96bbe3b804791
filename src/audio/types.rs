//! Core audio data types and sample conversions
//!
//! Defines the stream format descriptor shared by the playback and record
//! paths, the s16 → f32 packet conversion, and the guest volume mapping.
//!
//! **Format:**
//! - Guest packets are tightly packed signed 16-bit little-endian PCM
//! - Everything past the packet boundary runs as interleaved f32
//! - Frame stride is `channels * 4` bytes once converted

/// Maximum number of per-channel volume slots cached across stream restarts
pub const MAX_VOLUME_CHANNELS: usize = 8;

/// Sample format and channel layout of one stream direction.
///
/// Read once at stream start and held constant for the life of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Interleaved channel count (2 for stereo guests)
    pub channels: usize,

    /// Nominal sample rate in Hz
    pub sample_rate: u32,
}

impl StreamFormat {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Stride of one guest-side frame in bytes (s16 interleaved)
    pub fn guest_stride(&self) -> usize {
        self.channels * std::mem::size_of::<i16>()
    }

    /// Whole frames contained in a guest packet; a tail fragment that is not
    /// a multiple of the stride is dropped.
    pub fn guest_frames(&self, bytes: usize) -> usize {
        bytes / self.guest_stride()
    }
}

/// Convert a packed s16le guest packet into interleaved f32 samples.
///
/// `out` is cleared and refilled; a trailing partial sample is ignored.
pub fn s16le_to_f32(bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    out.reserve(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let s = i16::from_le_bytes([pair[0], pair[1]]);
        out.push(f32::from(s) / 32768.0);
    }
}

/// Map one guest volume step to a linear gain.
///
/// The guest reports volume on a logarithmic u16 scale; the curve below maps
/// 0 to (near) silence and 65535 to unity.
pub fn guest_volume_to_gain(volume: u16) -> f32 {
    let g = 9.3234e-7 * 1.000211902f64.powi(i32::from(volume)) - 0.000172787;
    g.max(0.0) as f32
}

/// Map a whole guest volume array, truncated to [`MAX_VOLUME_CHANNELS`].
pub fn guest_volumes_to_gains(volumes: &[u16]) -> Vec<f32> {
    volumes
        .iter()
        .take(MAX_VOLUME_CHANNELS)
        .map(|&v| guest_volume_to_gain(v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_stride() {
        let fmt = StreamFormat::new(2, 48000);
        assert_eq!(fmt.guest_stride(), 4);
        assert_eq!(fmt.guest_frames(1920), 480);
    }

    #[test]
    fn test_guest_frames_drops_tail_fragment() {
        let fmt = StreamFormat::new(2, 48000);
        // 3 extra bytes are not a whole frame
        assert_eq!(fmt.guest_frames(4 * 10 + 3), 10);
    }

    #[test]
    fn test_s16le_conversion() {
        let bytes = [
            0x00, 0x00, // 0
            0x00, 0x40, // 16384
            0x00, 0x80, // -32768
            0xff, 0x7f, // 32767
        ];
        let mut out = Vec::new();
        s16le_to_f32(&bytes, &mut out);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 0.5);
        assert_eq!(out[2], -1.0);
        assert!((out[3] - 32767.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn test_s16le_conversion_ignores_partial_sample() {
        let bytes = [0x00, 0x40, 0x12];
        let mut out = Vec::new();
        s16le_to_f32(&bytes, &mut out);
        assert_eq!(out, vec![0.5]);
    }

    #[test]
    fn test_volume_curve_endpoints() {
        // Bottom of the scale clamps to silence
        assert_eq!(guest_volume_to_gain(0), 0.0);

        // Top of the scale lands at roughly unity gain
        let top = guest_volume_to_gain(u16::MAX);
        assert!((0.95..=1.05).contains(&top), "top gain was {top}");
    }

    #[test]
    fn test_volume_curve_monotonic() {
        let mut prev = -1.0f32;
        for v in (0..=u16::MAX).step_by(4096) {
            let g = guest_volume_to_gain(v);
            assert!(g >= prev);
            prev = g;
        }
    }

    #[test]
    fn test_volume_array_truncated() {
        let volumes = [u16::MAX; 12];
        let gains = guest_volumes_to_gains(&volumes);
        assert_eq!(gains.len(), MAX_VOLUME_CHANNELS);
    }
}
