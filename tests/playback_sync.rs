//! End-to-end playback synchronization scenarios
//!
//! Drives the engine through the null backend with synthetic monotonic
//! timestamps, emulating a guest producing 480-frame packets every 10 ms
//! and a device pulling on its own schedule. Packets go in through
//! `playback_data_at`; pulls are pumped by hand, gated on the device
//! actually being armed (a real stream is inactive until then).

use spicelink::audio::device::null::{NullBackend, NullHandle};
use spicelink::audio::{AudioEngine, StreamState};
use spicelink::config::AudioOptions;

const RATE: u32 = 48000;
const CHANNELS: usize = 2;
const PACKET_FRAMES: usize = 480; // 10 ms of guest audio
const PACKET_NS: i64 = 10_000_000;

/// Half a millisecond, expressed in frames
const HALF_MS_FRAMES: f64 = 24.0;

/// A packet with every sample at 0.25, so real audio is distinguishable
/// from inserted silence.
fn dc_packet(frames: usize) -> Vec<u8> {
    let sample = 8192i16.to_le_bytes();
    let mut bytes = Vec::with_capacity(frames * CHANNELS * 2);
    for _ in 0..frames * CHANNELS {
        bytes.extend_from_slice(&sample);
    }
    bytes
}

fn new_engine(buffer_latency_ms: u32) -> (AudioEngine, NullHandle) {
    let (backend, handle) = NullBackend::new();
    // The device pulls whole guest-sized periods in these scenarios
    let backend = backend.with_max_period(PACKET_FRAMES);
    let opts = AudioOptions {
        period_size: PACKET_FRAMES,
        buffer_latency_ms,
        ..Default::default()
    };
    (AudioEngine::new(opts, Box::new(backend)), handle)
}

/// Run `steps` of lock-step pacing: a packet at `t`, a device pull half a
/// period later, 10 ms per step. Returns the time after the last step.
fn run_locked(
    engine: &mut AudioEngine,
    handle: &NullHandle,
    packet: &[u8],
    start: i64,
    steps: usize,
) -> i64 {
    let mut t = start;
    for _ in 0..steps {
        engine.playback_data_at(t, packet);
        if handle.is_playback_active() {
            handle.pull(t + PACKET_NS / 2, PACKET_FRAMES);
        }
        t += PACKET_NS;
    }
    t
}

/// Steady state: ideal pacing converges and stays converged, with no slew
/// events and no underrun.
#[test]
fn test_steady_state_sync() {
    // 24 ms of configured latency puts the target right at the level the
    // startup cushion establishes, so convergence is fast.
    let (mut engine, handle) = new_engine(24);
    engine.playback_start(CHANNELS, RATE);
    assert_eq!(engine.playback_state(), StreamState::SetupGuest);

    let packet = dc_packet(PACKET_FRAMES);
    let t = run_locked(&mut engine, &handle, &packet, 0, 10);
    assert_eq!(engine.playback_state(), StreamState::Run);

    // Two seconds in, the filtered offset error is inside half a millisecond
    let t = run_locked(&mut engine, &handle, &packet, t, 190);
    let stats = engine.playback_stats().unwrap();
    assert_eq!(stats.state, StreamState::Run);
    assert_eq!(stats.slew_count, 0);
    assert!(
        stats.offset_error_frames.abs() < HALF_MS_FRAMES,
        "offset error {} frames after 2s",
        stats.offset_error_frames
    );

    // ... and stays there for the next ten, without ever underrunning
    run_locked(&mut engine, &handle, &packet, t, 1000);
    let stats = engine.playback_stats().unwrap();
    assert_eq!(stats.slew_count, 0);
    assert!(stats.offset_error_frames.abs() < HALF_MS_FRAMES);
    assert!(
        stats.buffered_frames > 0,
        "ring underran: {} frames",
        stats.buffered_frames
    );

    // The conversion ratio never leaves the steady-state window
    assert!((stats.resample_ratio - 1.0).abs() < 0.01);
}

/// Startup cushion: the first pulls play silence for exactly the gap
/// between the startup target and what has arrived.
#[test]
fn test_startup_prebuffer_silence() {
    let (mut engine, handle) = new_engine(12);
    engine.playback_start(CHANNELS, RATE);

    let packet = dc_packet(PACKET_FRAMES);
    engine.playback_data_at(0, &packet);
    assert!(handle.is_playback_active(), "device armed by first packet");

    // target = 2 guest periods + device start demand (2 periods here);
    // one packet has arrived, so three periods of silence lead in.
    let expected_silence = 2 * PACKET_FRAMES + 2 * PACKET_FRAMES - PACKET_FRAMES;

    let mut samples = Vec::new();
    for i in 0..4i64 {
        let (buf, written) = handle.pull(PACKET_NS / 2 + i * PACKET_NS, PACKET_FRAMES);
        assert_eq!(written, PACKET_FRAMES);
        samples.extend_from_slice(&buf);
    }
    assert_eq!(engine.playback_state(), StreamState::Run);

    let silence_frames = samples
        .iter()
        .position(|&s| s != 0.0)
        .expect("audio should appear")
        / CHANNELS;
    assert!(
        silence_frames >= expected_silence && silence_frames <= expected_silence + 16,
        "silence lead-in was {silence_frames} frames, expected about {expected_silence}"
    );

    // The audio that follows is the guest's, at full level
    let data_start = (silence_frames + 8) * CHANNELS;
    assert!(samples[data_start..data_start + 32]
        .iter()
        .all(|&s| (s - 0.25).abs() < 0.02));
}

/// Device period shrink and grow: the target rises by the period
/// difference while the device runs small, and the transition never slews.
#[test]
fn test_device_period_shrink_then_grow() {
    let (mut engine, handle) = new_engine(24);
    engine.playback_start(CHANNELS, RATE);
    let packet = dc_packet(PACKET_FRAMES);

    let mut t = run_locked(&mut engine, &handle, &packet, 0, 300);
    let base_target = engine.playback_stats().unwrap().target_latency_frames;

    // Shrink: the device switches to 120-frame pulls. Double-buffering
    // means the gap after each period-change pull is still one *old*
    // period; after that the new cadence holds.
    const SMALL: usize = 120;
    const SMALL_NS: i64 = PACKET_NS / 4;
    let mut pull_t = t + PACKET_NS / 2; // first small pull, one old period after the last big one
    handle.pull(pull_t, SMALL);
    pull_t += PACKET_NS; // old-period gap once more while the last big buffer drains
    let shrink_end = pull_t + 50 * PACKET_NS; // 500 ms of small periods
    while pull_t < shrink_end {
        handle.pull(pull_t, SMALL);
        pull_t += SMALL_NS;
        // keep guest packets flowing on their own grid
        while t + PACKET_NS / 2 < pull_t {
            engine.playback_data_at(t, &packet);
            t += PACKET_NS;
        }
    }

    let stats = engine.playback_stats().unwrap();
    assert_eq!(stats.slew_count, 0, "period shrink must not slew");
    // max period still governs the base, plus the shrink compensation term
    assert!(
        (stats.target_latency_frames - (base_target + (PACKET_FRAMES - SMALL) as f64)).abs() < 1.0,
        "target during shrink was {}",
        stats.target_latency_frames
    );

    // Grow back: one old (small) gap after the change pull, then big cadence
    handle.pull(pull_t, PACKET_FRAMES);
    pull_t += SMALL_NS;
    for _ in 0..200 {
        handle.pull(pull_t, PACKET_FRAMES);
        pull_t += PACKET_NS;
        while t + PACKET_NS / 2 < pull_t {
            engine.playback_data_at(t, &packet);
            t += PACKET_NS;
        }
    }

    let stats = engine.playback_stats().unwrap();
    assert_eq!(stats.slew_count, 0, "period grow must not slew");
    assert!(
        (stats.target_latency_frames - base_target).abs() < 1.0,
        "target after grow was {}",
        stats.target_latency_frames
    );
    // The whole excursion stays far below anything audible as a jump
    assert!(stats.offset_error_frames.abs() < 96.0);
}

/// A 300 ms stall on the guest side produces exactly one slew event, after
/// which the integrators restart from zero and the loop re-converges.
#[test]
fn test_large_clock_skew_slews_once() {
    let (mut engine, handle) = new_engine(24);
    engine.playback_start(CHANNELS, RATE);
    let packet = dc_packet(PACKET_FRAMES);

    let mut t = run_locked(&mut engine, &handle, &packet, 0, 300);
    assert_eq!(engine.playback_stats().unwrap().slew_count, 0);

    // Guest stalls for 300 ms; the device keeps pulling (and underruns)
    for _ in 0..30 {
        handle.pull(t + PACKET_NS / 2, PACKET_FRAMES);
        t += PACKET_NS;
    }
    assert!(engine.playback_stats().unwrap().buffered_frames < 0);

    // The late packet lands 300 ms after the predicted time
    engine.playback_data_at(t, &packet);
    let stats = engine.playback_stats().unwrap();
    assert_eq!(stats.slew_count, 1);
    handle.pull(t + PACKET_NS / 2, PACKET_FRAMES);
    t += PACKET_NS;

    // One period later the loop is back on target, and stays there with no
    // further slews
    let _ = run_locked(&mut engine, &handle, &packet, t, 200);
    let stats = engine.playback_stats().unwrap();
    assert_eq!(stats.slew_count, 1, "exactly one slew event");
    assert!(stats.offset_error_frames.abs() < HALF_MS_FRAMES);
    assert!(stats.buffered_frames > 0);
}

/// Stop then restart with the same format reuses the keep-alive stream:
/// no device re-setup, no reallocation, one warm-up slew.
#[test]
fn test_warm_keep_reuse() {
    let (mut engine, handle) = new_engine(24);
    engine.playback_start(CHANNELS, RATE);
    let packet = dc_packet(PACKET_FRAMES);

    let mut t = run_locked(&mut engine, &handle, &packet, 0, 200);
    assert_eq!(handle.setup_count(), 1);

    engine.playback_stop();
    assert_eq!(engine.playback_state(), StreamState::KeepAlive);
    assert!(handle.is_playback_active(), "device stays open in keep-alive");

    // Five idle seconds: the device keeps pulling silence
    for _ in 0..500 {
        handle.pull(t + PACKET_NS / 2, PACKET_FRAMES);
        t += PACKET_NS;
    }
    assert_eq!(engine.playback_state(), StreamState::KeepAlive);

    // Restart with the identical format: a no-op, not a fresh setup
    engine.playback_start(CHANNELS, RATE);
    assert_eq!(engine.playback_state(), StreamState::KeepAlive);
    assert_eq!(handle.setup_count(), 1, "stream must be reused wholesale");

    // The first packet realigns with a single warm-up slew
    engine.playback_data_at(t, &packet);
    let stats = engine.playback_stats().unwrap();
    assert_eq!(stats.state, StreamState::Run);
    assert_eq!(stats.slew_count, 1);

    handle.pull(t + PACKET_NS / 2, PACKET_FRAMES);
    let _ = run_locked(&mut engine, &handle, &packet, t + PACKET_NS, 100);
    let stats = engine.playback_stats().unwrap();
    assert_eq!(stats.slew_count, 1);
    assert!(stats.buffered_frames > 0);
    assert_eq!(handle.setup_count(), 1);
}

/// Restarting out of keep-alive with a different format is a full stop and
/// fresh start.
#[test]
fn test_keep_alive_format_change_restarts() {
    let (mut engine, handle) = new_engine(24);
    engine.playback_start(CHANNELS, RATE);
    let packet = dc_packet(PACKET_FRAMES);
    run_locked(&mut engine, &handle, &packet, 0, 100);

    engine.playback_stop();
    assert_eq!(engine.playback_state(), StreamState::KeepAlive);

    engine.playback_start(CHANNELS, 44100);
    assert_eq!(engine.playback_state(), StreamState::SetupGuest);
    assert_eq!(handle.setup_count(), 2);
}

/// Thirty seconds of keep-alive underrun flags the stream stopped; the next
/// engine call reclaims everything.
#[test]
fn test_keep_alive_timeout() {
    let (mut engine, handle) = new_engine(24);
    engine.playback_start(CHANNELS, RATE);
    let packet = dc_packet(PACKET_FRAMES);

    let mut t = run_locked(&mut engine, &handle, &packet, 0, 100);
    engine.playback_stop();
    assert_eq!(engine.playback_state(), StreamState::KeepAlive);

    // 31 simulated seconds of silence pulls drain past the cutoff
    for _ in 0..3100 {
        handle.pull(t + PACKET_NS / 2, PACKET_FRAMES);
        t += PACKET_NS;
    }
    assert_eq!(engine.playback_state(), StreamState::Stop);

    // Pulls after stop write silence and report an empty chunk
    let (buf, written) = handle.pull(t, PACKET_FRAMES);
    assert_eq!(written, 0);
    assert!(buf.iter().all(|&s| s == 0.0));

    // Any engine call reaps the flagged stream
    engine.playback_stop();
    assert!(engine.playback_stats().is_none());
    assert!(!handle.is_playback_active());
}

/// Latency reports flow once per packet and the history ring tracks them.
#[test]
fn test_latency_reporting() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let (backend, handle) = NullBackend::new();
    let backend = backend.with_max_period(PACKET_FRAMES);
    handle.set_latency_frames(480); // device claims 10 ms of its own

    let count = Arc::new(AtomicUsize::new(0));
    let count_cb = Arc::clone(&count);
    let opts = AudioOptions {
        period_size: PACKET_FRAMES,
        buffer_latency_ms: 24,
        latency_cb: Some(Box::new(move |report| {
            count_cb.fetch_add(1, Ordering::Relaxed);
            assert!(
                (report.total_latency_ms - report.current_offset_ms - report.device_latency_ms)
                    .abs()
                    < 1e-9
            );
        })),
        ..Default::default()
    };

    let mut engine = AudioEngine::new(opts, Box::new(backend));
    engine.playback_start(CHANNELS, RATE);
    let packet = dc_packet(PACKET_FRAMES);
    run_locked(&mut engine, &handle, &packet, 0, 50);

    assert_eq!(count.load(Ordering::Relaxed), 50);
    let history = engine.latency_history();
    assert_eq!(history.len(), 50);

    // Once the loop is tracking, total latency = offset + device latency,
    // with the device's 10 ms clearly visible
    let last = *history.last().unwrap();
    assert!(last > 10.0, "total latency {last} ms should include device");
}
