//! Signed-count frame ring between the guest and device threads
//!
//! The playback buffer is a single-producer single-consumer ring of
//! interleaved f32 frames with one unusual property: its logical frame count
//! is *signed*. Consuming more than is buffered drives the count negative
//! (the missing frames were emitted as silence and are owed by the
//! producer); appending while the count is negative first discards enough
//! incoming frames to repay that debt. Both operations also accept negative
//! frame counts, which move the logical read/write heads without touching
//! data:
//!
//! - `consume(None, -n)` prepends `n` frames of silence ahead of the read
//!   head (used to line playback start up with the startup latency target)
//! - `append(None, -n)` marks the next `n` incoming frames for discard
//!
//! This is how the engine absorbs slews without reordering in-flight data:
//! whole frames are inserted or dropped at the heads, never in the middle.
//!
//! Storage is a lock-free `ringbuf` SPSC pair; the signed adjustment lives
//! in one shared atomic. The guest thread owns the [`RingWriter`], the
//! device pull thread owns the [`RingReader`].

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

struct RingShared {
    /// Signed head adjustment in frames. Positive: silence queued ahead of
    /// the read head. Negative: frames owed by the producer (underrun debt
    /// or a pending discard).
    slack: AtomicI64,
}

/// Create a playback ring holding up to `capacity_frames` buffered frames.
///
/// The capacity bounds only the *stored* side; the signed count can go
/// arbitrarily negative without storage.
pub fn frame_ring(capacity_frames: usize, channels: usize) -> (RingWriter, RingReader) {
    assert!(channels > 0);
    let rb = HeapRb::<f32>::new(capacity_frames * channels);
    let (prod, cons) = rb.split();
    let shared = Arc::new(RingShared {
        slack: AtomicI64::new(0),
    });

    (
        RingWriter {
            prod,
            shared: Arc::clone(&shared),
            channels,
        },
        RingReader {
            cons,
            shared,
            channels,
        },
    )
}

/// Producer half of the playback ring (guest thread).
pub struct RingWriter {
    prod: HeapProd<f32>,
    shared: Arc<RingShared>,
    channels: usize,
}

impl RingWriter {
    /// Signed logical frame count.
    pub fn count(&self) -> i64 {
        (self.prod.occupied_len() / self.channels) as i64
            + self.shared.slack.load(Ordering::Acquire)
    }

    /// Append `frames` frames.
    ///
    /// With `frames > 0`, writes from `src` (or silence when `src` is
    /// `None`), first repaying any outstanding deficit by discarding that
    /// many incoming frames. With `frames < 0`, schedules that many future
    /// frames for discard and drops the count immediately.
    pub fn append(&mut self, src: Option<&[f32]>, frames: i64) {
        if frames == 0 {
            return;
        }
        if frames < 0 {
            self.shared.slack.fetch_add(frames, Ordering::AcqRel);
            return;
        }

        let n = frames as usize;
        let mut repay = 0usize;
        let _ = self
            .shared
            .slack
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                if s < 0 {
                    repay = (-s).min(frames) as usize;
                    Some(s + repay as i64)
                } else {
                    repay = 0;
                    Some(s)
                }
            });

        let write = n - repay;
        if write == 0 {
            return;
        }

        let pushed = match src {
            Some(samples) => {
                debug_assert!(samples.len() >= n * self.channels);
                self.prod
                    .push_slice(&samples[repay * self.channels..n * self.channels])
            }
            None => self
                .prod
                .push_iter(std::iter::repeat(0.0).take(write * self.channels)),
        };

        if pushed < write * self.channels {
            // The consumer has stalled for longer than the ring can absorb.
            // The clock loop will slew once it resumes.
            warn!(
                dropped_frames = (write * self.channels - pushed) / self.channels,
                "playback ring full, dropping frames"
            );
        }
    }
}

/// Consumer half of the playback ring (device pull thread).
pub struct RingReader {
    cons: HeapCons<f32>,
    shared: Arc<RingShared>,
    channels: usize,
}

impl RingReader {
    /// Signed logical frame count.
    pub fn count(&self) -> i64 {
        (self.cons.occupied_len() / self.channels) as i64
            + self.shared.slack.load(Ordering::Acquire)
    }

    /// Consume `frames` frames.
    ///
    /// With `frames > 0`, fills `dst` (when present) with queued silence
    /// first, then buffered data; any shortfall becomes silence and drives
    /// the count negative. With `frames < 0`, prepends that many frames of
    /// silence ahead of the read head.
    pub fn consume(&mut self, dst: Option<&mut [f32]>, frames: i64) {
        if frames == 0 {
            return;
        }
        if frames < 0 {
            self.shared.slack.fetch_add(-frames, Ordering::AcqRel);
            return;
        }

        let n = frames as usize;
        let mut credit = 0usize;
        let _ = self
            .shared
            .slack
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                if s > 0 {
                    credit = s.min(frames) as usize;
                    Some(s - credit as i64)
                } else {
                    credit = 0;
                    Some(s)
                }
            });

        let want = n - credit;
        let popped_frames = match dst {
            Some(buf) => {
                debug_assert!(buf.len() >= n * self.channels);
                buf[..credit * self.channels].fill(0.0);
                let popped = self
                    .cons
                    .pop_slice(&mut buf[credit * self.channels..n * self.channels]);
                debug_assert_eq!(popped % self.channels, 0);
                let popped_frames = popped / self.channels;
                buf[(credit + popped_frames) * self.channels..n * self.channels].fill(0.0);
                popped_frames
            }
            None => self.cons.skip(want * self.channels) / self.channels,
        };

        let shortfall = want - popped_frames;
        if shortfall > 0 {
            self.shared
                .slack
                .fetch_sub(shortfall as i64, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo(frames: &[(f32, f32)]) -> Vec<f32> {
        frames.iter().flat_map(|&(l, r)| [l, r]).collect()
    }

    #[test]
    fn test_append_consume_round_trip() {
        let (mut w, mut r) = frame_ring(100, 2);
        assert_eq!(w.count(), 0);

        let data = stereo(&[(0.1, 0.2), (0.3, 0.4), (0.5, 0.6)]);
        w.append(Some(&data), 3);
        assert_eq!(w.count(), 3);
        assert_eq!(r.count(), 3);

        let mut out = vec![0.0f32; 6];
        r.consume(Some(&mut out), 3);
        assert_eq!(out, data);
        assert_eq!(r.count(), 0);
    }

    #[test]
    fn test_underrun_goes_negative_and_fills_silence() {
        let (mut w, mut r) = frame_ring(100, 2);
        w.append(Some(&stereo(&[(1.0, 1.0)])), 1);

        let mut out = vec![9.0f32; 8];
        r.consume(Some(&mut out), 4);

        // One real frame, three frames of silence
        assert_eq!(&out[..2], &[1.0, 1.0]);
        assert_eq!(&out[2..], &[0.0; 6]);
        assert_eq!(r.count(), -3);
    }

    #[test]
    fn test_append_repays_deficit_by_discarding() {
        let (mut w, mut r) = frame_ring(100, 2);

        // Consume 3 frames from an empty ring: count = -3
        r.consume(None, 3);
        assert_eq!(w.count(), -3);

        // Append 5 frames: the first 3 repay the debt, 2 are stored
        let data = stereo(&[(0.1, 0.1), (0.2, 0.2), (0.3, 0.3), (0.4, 0.4), (0.5, 0.5)]);
        w.append(Some(&data), 5);
        assert_eq!(w.count(), 2);

        // The stored frames are the *last* two; the late ones were dropped
        let mut out = vec![0.0f32; 4];
        r.consume(Some(&mut out), 2);
        assert_eq!(out, stereo(&[(0.4, 0.4), (0.5, 0.5)]));
    }

    #[test]
    fn test_silence_append() {
        let (mut w, mut r) = frame_ring(100, 2);
        w.append(None, 4);
        assert_eq!(w.count(), 4);

        let mut out = vec![1.0f32; 8];
        r.consume(Some(&mut out), 4);
        assert_eq!(out, vec![0.0; 8]);
    }

    #[test]
    fn test_negative_consume_prepends_silence() {
        let (mut w, mut r) = frame_ring(100, 2);
        w.append(Some(&stereo(&[(0.7, 0.7)])), 1);

        // Prepend 2 frames of silence ahead of the data
        r.consume(None, -2);
        assert_eq!(r.count(), 3);

        let mut out = vec![9.0f32; 6];
        r.consume(Some(&mut out), 3);
        assert_eq!(out, stereo(&[(0.0, 0.0), (0.0, 0.0), (0.7, 0.7)]));
    }

    #[test]
    fn test_negative_append_discards_future_frames() {
        let (mut w, mut r) = frame_ring(100, 2);
        w.append(None, -2);
        assert_eq!(w.count(), -2);

        w.append(Some(&stereo(&[(0.1, 0.1), (0.2, 0.2), (0.3, 0.3)])), 3);
        assert_eq!(w.count(), 1);

        let mut out = vec![0.0f32; 2];
        r.consume(Some(&mut out), 1);
        assert_eq!(out, stereo(&[(0.3, 0.3)]));
    }

    #[test]
    fn test_consume_without_destination_discards() {
        let (mut w, mut r) = frame_ring(100, 2);
        w.append(Some(&stereo(&[(0.1, 0.1), (0.2, 0.2)])), 2);
        r.consume(None, 1);
        assert_eq!(r.count(), 1);

        let mut out = vec![0.0f32; 2];
        r.consume(Some(&mut out), 1);
        assert_eq!(out, stereo(&[(0.2, 0.2)]));
    }

    #[test]
    fn test_fifo_order_preserved_across_slews() {
        let (mut w, mut r) = frame_ring(100, 1);

        w.append(Some(&[1.0, 2.0, 3.0]), 3);
        r.consume(None, -1); // silence prepend
        w.append(Some(&[4.0]), 1);

        let mut out = vec![0.0f32; 5];
        r.consume(Some(&mut out), 5);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_deep_underrun_accumulates() {
        let (w, mut r) = frame_ring(16, 2);
        for _ in 0..100 {
            r.consume(None, 10);
        }
        assert_eq!(w.count(), -1000);
        assert_eq!(r.count(), -1000);
    }
}
