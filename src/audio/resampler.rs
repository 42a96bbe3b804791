//! Continuously-steered sample-rate conversion using rubato
//!
//! The guest nominally produces audio at the device rate, but the two clocks
//! drift and wander relative to each other. The latency controller corrects
//! this by resampling every guest packet with a ratio steered slightly above
//! or below 1.0. `FastFixedIn` keeps filter state across packets so the
//! steering is glitch-free, and its runtime ratio adjustment is ramped over
//! each chunk to avoid audible pitch steps.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Headroom for runtime ratio changes. Steady-state corrections stay within
/// a fraction of a percent; anything larger is handled by slewing instead.
pub const MAX_RATIO_RELATIVE: f64 = 1.1;

/// Stateful resampler processing fixed-size guest packets with a ratio
/// steered per packet.
///
/// One instance exists per playback stream. The chunk size is the guest
/// packet period; when the guest changes its packet size the stream
/// recreates the resampler (and its scratch buffers) to match.
pub struct AdaptiveResampler {
    inner: FastFixedIn<f32>,
    channels: usize,
    chunk_frames: usize,

    /// Planar scratch, one Vec per channel
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
}

impl AdaptiveResampler {
    /// Create a resampler for `chunk_frames`-frame packets at unity ratio.
    pub fn new(channels: usize, chunk_frames: usize) -> Result<Self> {
        let inner = FastFixedIn::<f32>::new(
            1.0,
            MAX_RATIO_RELATIVE,
            PolynomialDegree::Septic,
            chunk_frames,
            channels,
        )
        .map_err(|e| Error::ResamplerInit {
            channels,
            chunk_frames,
            message: e.to_string(),
        })?;

        let input = inner.input_buffer_allocate(true);
        let output = inner.output_buffer_allocate(true);

        debug!(channels, chunk_frames, "created adaptive resampler");

        Ok(Self {
            inner,
            channels,
            chunk_frames,
            input,
            output,
        })
    }

    /// Packet size this instance was built for, in frames.
    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    /// Drop filter state so the instance is safe to reuse for a new stream
    /// with the same format.
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Steer the conversion ratio (output frames per input frame). The value
    /// is clamped into the window the converter was built with; the change
    /// ramps over the next chunk.
    pub fn set_ratio(&mut self, ratio: f64) -> Result<()> {
        let clamped = ratio.clamp(1.0 / MAX_RATIO_RELATIVE + 1e-6, MAX_RATIO_RELATIVE - 1e-6);
        self.inner
            .set_resample_ratio(clamped, true)
            .map_err(|e| Error::ResamplerProcess(e.to_string()))
    }

    /// Convert one interleaved packet, appending the interleaved result to
    /// `out`. Returns the number of frames generated.
    ///
    /// `interleaved` must hold exactly one chunk.
    pub fn process_into(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> Result<usize> {
        let frames = interleaved.len() / self.channels;
        if frames != self.chunk_frames {
            return Err(Error::ResamplerProcess(format!(
                "packet of {} frames does not match chunk size {}",
                frames, self.chunk_frames
            )));
        }

        // De-interleave into the planar scratch
        for (ch, plane) in self.input.iter_mut().enumerate() {
            plane.clear();
            plane.extend(
                interleaved[ch..]
                    .iter()
                    .step_by(self.channels)
                    .take(frames),
            );
        }

        let (consumed, generated) = self
            .inner
            .process_into_buffer(&self.input, &mut self.output, None)
            .map_err(|e| Error::ResamplerProcess(e.to_string()))?;
        debug_assert_eq!(consumed, frames);

        // Re-interleave into the caller's staging buffer
        out.clear();
        out.reserve(generated * self.channels);
        for frame in 0..generated {
            for plane in &self.output {
                out.push(plane[frame]);
            }
        }

        Ok(generated)
    }
}
