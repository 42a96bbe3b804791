//! Error types for the audio bridge

use thiserror::Error;

/// Main error type for the audio bridge
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors from file operations (config file, wav sink)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Host audio device errors
    #[error("Audio device error: {0}")]
    Device(String),

    /// Sample-rate converter construction failed
    #[error("Failed to create resampler ({channels}ch, chunk {chunk_frames}): {message}")]
    ResamplerInit {
        channels: usize,
        chunk_frames: usize,
        message: String,
    },

    /// Sample-rate converter rejected a packet
    #[error("Resampling failed: {0}")]
    ResamplerProcess(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, Error>;
