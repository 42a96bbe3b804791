//! Playback Sync Probe
//!
//! Drives the full playback engine with a synthetic guest: paced s16 tone
//! packets go in, clock-synchronized audio comes out of the chosen backend
//! (host device or wav file), and latency statistics are reported along the
//! way. Useful for validating the sync loop on a machine without a guest,
//! and for inspecting its output offline.
//!
//! **Usage:**
//! ```bash
//! sync-probe [--config probe.toml] [--wav out.wav] [--duration 10]
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use spicelink::audio::device::{cpal_backend::CpalBackend, wav::WavBackend, AudioBackend};
use spicelink::audio::{AudioEngine, LatencyReport};
use spicelink::config::{AudioOptions, ProbeConfig};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::info;

/// Playback sync probe
#[derive(Parser, Debug)]
#[clap(name = "sync-probe")]
#[clap(about = "Exercise the adaptive playback sync engine with a synthetic guest")]
struct Args {
    /// Path to TOML configuration file
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Playback device name (overrides config file)
    #[clap(long)]
    sink: Option<String>,

    /// Device period to request, in frames (overrides config file)
    #[clap(long)]
    period_size: Option<usize>,

    /// Extra buffered latency in milliseconds (overrides config file)
    #[clap(long)]
    buffer_latency: Option<u32>,

    /// Write output to this wav file instead of the host device
    #[clap(long, value_name = "FILE")]
    wav: Option<PathBuf>,

    /// Probe duration in seconds
    #[clap(long, default_value = "10")]
    duration: u64,

    /// Synthetic guest sample rate
    #[clap(long, default_value = "48000")]
    rate: u32,

    /// Frames per synthetic guest packet
    #[clap(long, default_value = "480")]
    packet_frames: usize,

    /// Tone frequency in Hz
    #[clap(long, default_value = "440.0")]
    tone_hz: f64,
}

const CHANNELS: usize = 2;

/// Report every Nth latency measurement, matching the pace a status line
/// can usefully update at.
const REPORT_EVERY: u32 = 8;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ProbeConfig::load(
        args.config.as_deref(),
        args.sink.clone(),
        args.period_size,
        args.buffer_latency,
    )?;
    info!(?config, "probe configuration");

    let backend: Box<dyn AudioBackend> = match &args.wav {
        Some(path) => {
            info!(path = %path.display(), "writing to wav sink");
            Box::new(WavBackend::new(path))
        }
        None => Box::new(CpalBackend::new().context("failed to initialize host audio")?),
    };

    let (report_tx, report_rx) = mpsc::channel::<LatencyReport>();
    let mut counter = 0u32;
    let opts = AudioOptions {
        period_size: config.period_size,
        buffer_latency_ms: config.buffer_latency_ms,
        sink: config.sink.clone(),
        source: config.source.clone(),
        latency_cb: Some(Box::new(move |report| {
            counter += 1;
            if counter % REPORT_EVERY == 0 {
                let _ = report_tx.send(report);
            }
        })),
        record_writer: None,
    };

    let mut engine = AudioEngine::new(opts, backend);
    engine.playback_start(CHANNELS, args.rate);

    info!(
        duration_secs = args.duration,
        rate = args.rate,
        packet_frames = args.packet_frames,
        "feeding synthetic guest packets"
    );

    let packet_period = Duration::from_secs_f64(args.packet_frames as f64 / f64::from(args.rate));
    let total_packets = (args.duration * u64::from(args.rate)) / args.packet_frames as u64;
    let mut packet = vec![0u8; args.packet_frames * CHANNELS * 2];
    let mut phase = 0.0f64;
    let phase_step = 2.0 * std::f64::consts::PI * args.tone_hz / f64::from(args.rate);

    let start = Instant::now();
    let mut reports = Vec::new();
    for n in 0..total_packets {
        fill_tone_packet(&mut packet, &mut phase, phase_step);
        engine.playback_data(&packet);

        while let Ok(report) = report_rx.try_recv() {
            info!(
                offset_ms = format_args!("{:.2}", report.current_offset_ms),
                device_ms = format_args!("{:.2}", report.device_latency_ms),
                total_ms = format_args!("{:.2}", report.total_latency_ms),
                "latency"
            );
            reports.push(report);
        }

        // Pace packets against wall-clock, not cumulative sleeps
        let deadline = packet_period * (n as u32 + 1);
        if let Some(wait) = deadline.checked_sub(start.elapsed()) {
            std::thread::sleep(wait);
        }
    }

    engine.playback_stop();

    if let Some(stats) = engine.playback_stats() {
        info!(
            state = ?stats.state,
            buffered_frames = stats.buffered_frames,
            target_latency_frames = format_args!("{:.0}", stats.target_latency_frames),
            slew_count = stats.slew_count,
            "final sync state"
        );
    }
    summarize(&reports);

    // Let the device drain the tail before tearing down
    std::thread::sleep(Duration::from_millis(200));
    engine.free();
    Ok(())
}

/// Fill one s16le stereo packet with the probe tone.
fn fill_tone_packet(packet: &mut [u8], phase: &mut f64, phase_step: f64) {
    for frame in packet.chunks_exact_mut(CHANNELS * 2) {
        let s = ((*phase).sin() * 0.25 * 32767.0) as i16;
        *phase += phase_step;
        let bytes = s.to_le_bytes();
        for sample in frame.chunks_exact_mut(2) {
            sample.copy_from_slice(&bytes);
        }
    }
    *phase %= 2.0 * std::f64::consts::PI;
}

fn summarize(reports: &[LatencyReport]) {
    if reports.is_empty() {
        info!("no latency reports collected");
        return;
    }

    // Skip the first quarter so startup convergence does not skew the figures
    let steady = &reports[reports.len() / 4..];
    let mean = steady.iter().map(|r| r.total_latency_ms).sum::<f64>() / steady.len() as f64;
    let max = steady
        .iter()
        .map(|r| r.total_latency_ms)
        .fold(f64::MIN, f64::max);
    let min = steady
        .iter()
        .map(|r| r.total_latency_ms)
        .fold(f64::MAX, f64::min);

    info!(
        samples = steady.len(),
        mean_ms = format_args!("{:.2}", mean),
        min_ms = format_args!("{:.2}", min),
        max_ms = format_args!("{:.2}", max),
        jitter_ms = format_args!("{:.2}", max - min),
        "steady-state latency summary"
    );
}
