//! Command-line player.
//!
//! Plays each file given on the command line through the engine and ticks the
//! scheduler at the configured frame rate until every player is done.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, warn};

use cadence_common::AudioId;

use crate::audio_engine::AudioEngine;
use crate::config::EngineConfig;
use crate::scheduler::Scheduler;
use crate::timing::FrameTiming;

/// Parsed command line.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "cadence", version, about = "Play audio files through the Cadence engine")]
pub struct PlayerOptions {
    /// Config file to use instead of the default location.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Loop every file.
    #[arg(long = "loop")]
    pub looping: bool,

    /// Volume override (0.0 - 1.0).
    #[arg(long)]
    pub volume: Option<f32>,

    /// Files to play.
    #[arg(required = true)]
    pub files: Vec<String>,
}

/// Play every file and block until playback ends.
pub fn run(options: &PlayerOptions) -> Result<()> {
    let config = match &options.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    };
    let volume = options.volume.unwrap_or(config.default_volume);
    let frame_rate = config.frame_rate;

    let scheduler = Arc::new(Scheduler::new());
    let engine = AudioEngine::new(config, Arc::clone(&scheduler));
    if !engine.init() {
        bail!("no audio output device available");
    }

    let started: Vec<AudioId> = options
        .files
        .iter()
        .filter_map(|file| {
            let id = engine.play(file, options.looping, volume);
            if !id.is_valid() {
                warn!("Could not play {file}");
                return None;
            }
            info!("{id} playing {file}");
            engine.set_finish_callback(id, |id, path| info!("{id} finished {path}"));
            Some(id)
        })
        .collect();

    if started.is_empty() {
        bail!("none of the {} files could be played", options.files.len());
    }

    play_until_idle(&engine, &scheduler, frame_rate);
    engine.shutdown();
    Ok(())
}

/// Tick `scheduler` once per frame while `engine` has players.
pub fn play_until_idle(engine: &AudioEngine, scheduler: &Scheduler, frame_rate: u32) {
    let mut timing = FrameTiming::new(frame_rate);
    while engine.playing_count() > 0 {
        let dt = timing.delta_time();
        scheduler.tick(dt);
        timing.sleep_remainder();
    }
}
