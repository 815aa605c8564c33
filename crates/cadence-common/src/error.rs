//! Error types for Project Cadence.

use std::path::PathBuf;

use thiserror::Error;

use crate::ids::SourceId;

/// Audio subsystem error types.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Failed to initialize audio device.
    #[error("Failed to initialize audio device: {0}")]
    DeviceInitFailed(String),

    /// No audio device available.
    #[error("No audio device available")]
    NoDevice,

    /// Failed to create a playback sink for a voice.
    #[error("Failed to create audio sink: {0}")]
    SinkCreationFailed(String),

    /// The device could not provide the requested number of voices.
    #[error("Could only allocate {available} of {requested} voices")]
    VoiceAllocationFailed {
        /// Number of voices asked for.
        requested: usize,
        /// Number of voices the device can provide.
        available: usize,
    },

    /// Failed to load audio file.
    #[error("Failed to load audio file '{path}': {message}")]
    LoadFailed {
        /// Path to the file that failed to load.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Failed to decode audio data.
    #[error("Failed to decode audio: {0}")]
    DecodeFailed(String),

    /// The voice was never allocated by this backend.
    #[error("Unknown voice {0}")]
    UnknownVoice(SourceId),

    /// A driver call returned a nonzero error code.
    #[error("Driver call '{op}' failed with code {code:#x}")]
    Driver {
        /// Name of the failed operation.
        op: &'static str,
        /// Error code reported by the driver.
        code: u32,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;
