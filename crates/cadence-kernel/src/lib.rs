//! # Cadence Kernel
//!
//! Device-level audio plumbing for the Cadence playback engine.
//!
//! This crate provides everything below the engine's player bookkeeping:
//! - Voice backends: a fixed set of hardware voices addressed by id
//! - Decoders that turn files into interleaved `f32` PCM
//! - Buffered and streamed voice feeds with looping and seeking
//! - A FIFO pool for handing voices out to players
//!
//! ## Backends
//!
//! `RodioBackend` drives the default output device. `SimulatedBackend` keeps
//! voice state in memory and advances it on demand; the engine's tests and
//! headless runs use it together with `MemoryDecoder`.
//!
//! ## Threading
//!
//! Backends and decoders are `Send + Sync` and may be called from the game
//! thread and the decode workers at the same time. Voice sources run on the
//! mixer thread and are steered through lock-free `VoiceControls`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod audio;
pub mod audio_backend;
pub mod audio_decode;
pub mod audio_resource;
pub mod audio_sim;
pub mod audio_source;
pub mod source_pool;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::audio::*;
}

pub use prelude::*;
