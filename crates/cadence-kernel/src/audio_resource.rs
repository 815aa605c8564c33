//! Audio Resource Types
//!
//! Plain data shared between decoders, caches and voices:
//! - `PcmFormat`: sample rate, channel layout and (if known) length
//! - `PcmBuffer`: fully decoded interleaved samples
//! - `VoiceFeed`: what a voice plays, either a shared buffer or a stream
//!
//! Short sounds are decoded once into a `PcmBuffer` and shared by every voice
//! playing them. Long sounds are streamed: each voice opens its own stream
//! through a `StreamOpener`.

use std::sync::Arc;

use crate::audio_decode::PcmStream;
use cadence_common::AudioResult;

/// Default sample rate for audio processing.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default number of channels (stereo).
pub const DEFAULT_CHANNELS: u16 = 2;

/// Layout of decoded PCM data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Total frames in the source, when the container reports it.
    pub total_frames: Option<u64>,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            total_frames: None,
        }
    }
}

impl PcmFormat {
    /// Create a format with a known length.
    #[must_use]
    pub const fn new(sample_rate: u32, channels: u16, total_frames: Option<u64>) -> Self {
        Self {
            sample_rate,
            channels,
            total_frames,
        }
    }

    /// Size of one decoded frame in bytes.
    #[must_use]
    pub const fn bytes_per_frame(&self) -> usize {
        self.channels as usize * std::mem::size_of::<f32>()
    }

    /// Duration in seconds, if the length is known.
    #[must_use]
    pub fn duration_secs(&self) -> Option<f32> {
        if self.sample_rate == 0 {
            return None;
        }
        self.total_frames
            .map(|frames| (frames as f64 / f64::from(self.sample_rate)) as f32)
    }

    /// Convert a time offset into a frame index.
    #[must_use]
    pub fn frames_for(&self, seconds: f32) -> u64 {
        (f64::from(seconds.max(0.0)) * f64::from(self.sample_rate)) as u64
    }
}

/// Fully decoded audio held in memory.
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    /// Sample layout.
    pub format: PcmFormat,
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
}

impl PcmBuffer {
    /// Create a buffer; the format's frame count is taken from the samples.
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        let channels = channels.max(1);
        let frames = (samples.len() / channels as usize) as u64;
        Self {
            format: PcmFormat::new(sample_rate, channels, Some(frames)),
            samples,
        }
    }

    /// Number of frames (samples per channel).
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    /// Get the size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

/// Reopens a stream from the start; used by streamed voices to loop and seek.
pub type StreamOpener = Arc<dyn Fn() -> AudioResult<Box<dyn PcmStream>> + Send + Sync>;

/// Audio handed to a voice for playback.
#[derive(Clone)]
pub enum VoiceFeed {
    /// Shared, fully decoded samples.
    Buffered(Arc<PcmBuffer>),
    /// Samples decoded on the fly from a fresh stream.
    Streamed {
        /// Layout reported by the stream.
        format: PcmFormat,
        /// Opens a new stream positioned at the first frame.
        open: StreamOpener,
    },
}

impl std::fmt::Debug for VoiceFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(buffer) => f
                .debug_struct("Buffered")
                .field("format", &buffer.format)
                .field("frames", &buffer.frames())
                .finish(),
            Self::Streamed { format, .. } => f
                .debug_struct("Streamed")
                .field("format", format)
                .finish_non_exhaustive(),
        }
    }
}

impl VoiceFeed {
    /// Layout of the audio.
    #[must_use]
    pub fn format(&self) -> PcmFormat {
        match self {
            Self::Buffered(buffer) => buffer.format,
            Self::Streamed { format, .. } => *format,
        }
    }

    /// Duration in seconds, if known.
    #[must_use]
    pub fn duration_secs(&self) -> Option<f32> {
        self.format().duration_secs()
    }

    /// Check if this feed streams from its source.
    #[must_use]
    pub const fn is_streamed(&self) -> bool {
        matches!(self, Self::Streamed { .. })
    }
}
