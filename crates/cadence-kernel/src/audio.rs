//! Audio System
//!
//! This module gathers the kernel's audio types in one place.
//!
//! # Modules
//!
//! - [`audio_backend`](crate::audio_backend): Voice interface and rodio output
//! - [`audio_decode`](crate::audio_decode): File decoding into PCM streams
//! - [`audio_resource`](crate::audio_resource): PCM formats, buffers and feeds
//! - [`audio_source`](crate::audio_source): The sample source played by a voice
//! - [`audio_sim`](crate::audio_sim): In-memory backend and decoder for tests and headless runs
//! - [`source_pool`](crate::source_pool): FIFO pool of voices
//!
//! # Quick Start
//!
//! ```ignore
//! use cadence_kernel::audio::*;
//!
//! let backend = RodioBackend::open()?;
//! let mut pool = SourcePool::new(backend.allocate_voices(MAX_VOICES)?);
//!
//! let mut stream = RodioDecoder::new().open(Path::new("assets/sfx/click.wav"))?;
//! let buffer = Arc::new(read_to_end(stream.as_mut())?);
//!
//! if let Some(voice) = pool.acquire() {
//!     backend.play(voice, VoiceFeed::Buffered(buffer), VoiceParams::default())?;
//! }
//! ```

pub use crate::audio_backend::{
    RodioBackend, VoiceBackend, VoiceParams, VoiceState, DRIVER_INVALID_OPERATION, MAX_VOICES,
};

pub use crate::audio_decode::{read_to_end, AudioDecoder, PcmStream, RodioDecoder, DECODE_CHUNK_FRAMES};

pub use crate::audio_resource::{
    PcmBuffer, PcmFormat, StreamOpener, VoiceFeed, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE,
};

pub use crate::audio_source::{VoiceControls, VoiceSource};

pub use crate::audio_sim::{MemoryDecoder, SimulatedBackend, VoiceSnapshot};

pub use crate::source_pool::SourcePool;
