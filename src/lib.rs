//! # spicelink
//!
//! Audio core of a headless virtualization bridge: plays a guest's PCM
//! stream on the host sound device with bounded, adaptive latency, and
//! passes host capture audio back to the guest.
//!
//! **Purpose:** hide virtualization-link jitter and host device period
//! changes behind a clock-synchronized, resampled playback path that never
//! glitches on state changes.
//!
//! **Architecture:** two phase-locked clock models (guest packets, device
//! pulls) feeding a PI-steered sample-rate converter over a signed-count
//! frame ring, built on rubato + ringbuf + cpal.
//!
//! The network protocol client, input grabbing, and display switching are
//! external collaborators: they drive [`audio::AudioEngine`] through its
//! playback/record methods and provide the backend via
//! [`audio::device::AudioBackend`].

pub mod audio;
pub mod config;
pub mod error;

pub use audio::AudioEngine;
pub use config::AudioOptions;
pub use error::{Error, Result};
