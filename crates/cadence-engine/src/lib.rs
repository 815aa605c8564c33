//! # Cadence Engine
//!
//! Audio playback engine: shared decode caches, players bound to hardware
//! voices, and a reap pass that recycles voices as playback ends.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use cadence_engine::{AudioEngine, EngineConfig, Scheduler};
//!
//! let scheduler = Arc::new(Scheduler::new());
//! let engine = AudioEngine::new(EngineConfig::load(), Arc::clone(&scheduler));
//! if engine.init() {
//!     let id = engine.play("sfx/click.wav", false, 1.0);
//!     engine.set_finish_callback(id, |id, path| println!("{id} finished {path}"));
//! }
//!
//! // Once per frame on the main thread:
//! scheduler.tick(dt);
//! ```
//!
//! ## Threads
//!
//! Files decode on the engine's worker threads. Playback starts from whichever
//! thread finishes the decode; everything else, including finish callbacks,
//! runs on the thread that ticks the scheduler or calls the engine.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod app;
pub mod audio_cache;
pub mod audio_engine;
pub mod audio_player;
pub mod config;
pub mod scheduler;
pub mod task_pool;
pub mod timing;

pub use audio_cache::{AudioCache, CacheOutcome, CacheState, LoadCallback, PlayCallback};
pub use audio_engine::{normalize_path, AudioEngine, TIME_UNKNOWN};
pub use audio_player::{AudioPlayer, AudioState, FinishCallback};
pub use config::EngineConfig;
pub use scheduler::{ScheduleCallback, ScheduleKey, Scheduler};
pub use task_pool::TaskPool;
