//! Audio Backend with Rodio Integration
//!
//! This module defines the voice-level device interface used by the engine
//! and its rodio implementation:
//!
//! - `VoiceBackend`: a fixed set of hardware voices driven by id
//! - `RodioBackend`: one rodio `Sink` per voice on the default output device
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RodioBackend                           │
//! │  ┌──────────────────┐   ┌────────────────────────────────┐  │
//! │  │  device thread   │   │  voices: Vec<Mutex<VoiceSlot>> │  │
//! │  │  (OutputStream)  │──▶│  Sink + VoiceControls per slot │  │
//! │  └──────────────────┘   └────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! rodio's `OutputStream` cannot leave the thread that created it, so the
//! backend parks it on a dedicated thread and keeps only the `Send` stream
//! handle. Sinks are created from the handle on whichever thread starts a
//! voice.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, error, info, warn};

use crate::audio_resource::VoiceFeed;
use crate::audio_source::{VoiceControls, VoiceSource};
use cadence_common::{AudioError, AudioResult, SourceId};

/// Maximum number of simultaneous voices.
pub const MAX_VOICES: usize = 32;

/// Play state of a hardware voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// Voice has not played anything yet.
    #[default]
    Initial,
    /// Voice is producing audio.
    Playing,
    /// Voice is paused and keeps its position.
    Paused,
    /// Voice ran out of audio or was stopped.
    Stopped,
}

impl VoiceState {
    /// Check if the voice has nothing left to play.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Per-voice parameters applied when playback starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    /// Volume multiplier (0.0-1.0).
    pub volume: f32,
    /// Whether to loop the audio.
    pub looping: bool,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            looping: false,
        }
    }
}

/// A device exposing a fixed set of mixable voices.
///
/// Every call is addressed by a [`SourceId`] returned from
/// [`allocate_voices`](Self::allocate_voices). Calls never block on playback;
/// failures are reported as [`AudioError::Driver`].
pub trait VoiceBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Reserve `count` voices on the device.
    fn allocate_voices(&self, count: usize) -> AudioResult<Vec<SourceId>>;

    /// Start playing `feed` on `voice`, replacing whatever it played before.
    fn play(&self, voice: SourceId, feed: VoiceFeed, params: VoiceParams) -> AudioResult<()>;

    /// Pause a voice.
    fn pause(&self, voice: SourceId) -> AudioResult<()>;

    /// Resume a paused voice.
    fn resume(&self, voice: SourceId) -> AudioResult<()>;

    /// Stop a voice and drop its audio.
    fn stop(&self, voice: SourceId) -> AudioResult<()>;

    /// Set a voice's volume.
    fn set_volume(&self, voice: SourceId, volume: f32) -> AudioResult<()>;

    /// Toggle looping on a playing voice.
    fn set_looping(&self, voice: SourceId, looping: bool) -> AudioResult<()>;

    /// Playback position in seconds.
    fn offset(&self, voice: SourceId) -> AudioResult<f32>;

    /// Move the playback position.
    fn set_offset(&self, voice: SourceId, seconds: f32) -> AudioResult<()>;

    /// Query a voice's play state.
    fn voice_state(&self, voice: SourceId) -> AudioResult<VoiceState>;

    /// Stop every voice and release the device.
    fn shutdown(&self);
}

/// Owns the output stream on its own thread.
struct DeviceThread {
    shutdown_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// State of one rodio voice.
struct VoiceSlot {
    /// The rodio sink.
    sink: Sink,
    /// Controls of the source currently in the sink.
    controls: Option<std::sync::Arc<VoiceControls>>,
    /// Whether anything was ever played on this slot.
    started: bool,
}

impl std::fmt::Debug for VoiceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSlot")
            .field("started", &self.started)
            .field("empty", &self.sink.empty())
            .field("paused", &self.sink.is_paused())
            .finish_non_exhaustive()
    }
}

/// Voice backend on the default output device.
pub struct RodioBackend {
    handle: OutputStreamHandle,
    device: Mutex<Option<DeviceThread>>,
    voices: RwLock<Vec<Mutex<VoiceSlot>>>,
}

impl std::fmt::Debug for RodioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RodioBackend")
            .field("voices", &self.voices.read().len())
            .field("open", &self.device.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl RodioBackend {
    /// Open the default output device.
    pub fn open() -> AudioResult<Self> {
        let (handle_tx, handle_rx) = bounded::<AudioResult<OutputStreamHandle>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let join = thread::Builder::new()
            .name("cadence-audio-device".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = handle_tx.send(Err(AudioError::DeviceInitFailed(e.to_string())));
                        return;
                    },
                };
                if handle_tx.send(Ok(handle)).is_err() {
                    return;
                }
                // Keep the stream alive until shutdown or until the backend is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Audio device thread exiting");
            })?;

        let handle = match handle_rx.recv() {
            Ok(result) => result?,
            Err(_) => return Err(AudioError::NoDevice),
        };

        info!("Audio device initialized");

        Ok(Self {
            handle,
            device: Mutex::new(Some(DeviceThread { shutdown_tx, join })),
            voices: RwLock::new(Vec::new()),
        })
    }

    fn create_sink(&self) -> AudioResult<Sink> {
        Sink::try_new(&self.handle).map_err(|e| AudioError::SinkCreationFailed(e.to_string()))
    }

    fn with_slot<R>(&self, voice: SourceId, f: impl FnOnce(&mut VoiceSlot) -> R) -> AudioResult<R> {
        let voices = self.voices.read();
        let slot = voices
            .get(voice.index())
            .ok_or(AudioError::UnknownVoice(voice))?;
        let mut slot = slot.lock();
        Ok(f(&mut slot))
    }
}

impl VoiceBackend for RodioBackend {
    fn name(&self) -> &'static str {
        "rodio"
    }

    fn allocate_voices(&self, count: usize) -> AudioResult<Vec<SourceId>> {
        let mut voices = self.voices.write();
        let first = voices.len();

        for i in 0..count {
            match self.create_sink() {
                Ok(sink) => voices.push(Mutex::new(VoiceSlot {
                    sink,
                    controls: None,
                    started: false,
                })),
                Err(e) => {
                    warn!("Could only create {} of {} audio voices: {e}", i, count);
                    voices.truncate(first);
                    return Err(AudioError::VoiceAllocationFailed {
                        requested: count,
                        available: i,
                    });
                },
            }
        }

        debug!("Allocated {} rodio voices", count);
        Ok((first..first + count).map(|i| SourceId::new(i as u32)).collect())
    }

    fn play(&self, voice: SourceId, feed: VoiceFeed, params: VoiceParams) -> AudioResult<()> {
        // A stopped sink cannot be reused reliably, so every play gets a fresh one.
        let sink = self.create_sink()?;
        let controls = VoiceControls::new(feed.format().sample_rate, params.looping);
        let source = VoiceSource::new(feed, std::sync::Arc::clone(&controls));

        sink.set_volume(params.volume);
        sink.append(source);
        sink.play();

        self.with_slot(voice, move |slot| {
            slot.sink.stop();
            slot.sink = sink;
            slot.controls = Some(controls);
            slot.started = true;
        })
    }

    fn pause(&self, voice: SourceId) -> AudioResult<()> {
        self.with_slot(voice, |slot| slot.sink.pause())
    }

    fn resume(&self, voice: SourceId) -> AudioResult<()> {
        self.with_slot(voice, |slot| slot.sink.play())
    }

    fn stop(&self, voice: SourceId) -> AudioResult<()> {
        self.with_slot(voice, |slot| {
            slot.sink.stop();
            slot.controls = None;
        })
    }

    fn set_volume(&self, voice: SourceId, volume: f32) -> AudioResult<()> {
        self.with_slot(voice, |slot| slot.sink.set_volume(volume))
    }

    fn set_looping(&self, voice: SourceId, looping: bool) -> AudioResult<()> {
        self.with_slot(voice, |slot| {
            if let Some(controls) = &slot.controls {
                controls.set_looping(looping);
            }
        })
    }

    fn offset(&self, voice: SourceId) -> AudioResult<f32> {
        self.with_slot(voice, |slot| {
            slot.controls
                .as_ref()
                .map_or(0.0, |controls| controls.position_secs())
        })
    }

    fn set_offset(&self, voice: SourceId, seconds: f32) -> AudioResult<()> {
        let controls = self.with_slot(voice, |slot| slot.controls.clone())?;
        let controls = controls.ok_or(AudioError::Driver {
            op: "set_offset",
            code: DRIVER_INVALID_OPERATION,
        })?;
        let frame = (f64::from(seconds.max(0.0)) * f64::from(controls.sample_rate())) as u64;
        controls.request_seek(frame);
        Ok(())
    }

    fn voice_state(&self, voice: SourceId) -> AudioResult<VoiceState> {
        self.with_slot(voice, |slot| {
            if !slot.started {
                VoiceState::Initial
            } else if slot.sink.empty() {
                VoiceState::Stopped
            } else if slot.sink.is_paused() {
                VoiceState::Paused
            } else {
                VoiceState::Playing
            }
        })
    }

    fn shutdown(&self) {
        for slot in self.voices.read().iter() {
            let mut slot = slot.lock();
            slot.sink.stop();
            slot.controls = None;
        }

        if let Some(device) = self.device.lock().take() {
            let _ = device.shutdown_tx.send(());
            if device.join.join().is_err() {
                error!("Audio device thread panicked");
            }
            info!("Audio device closed");
        }
    }
}

impl Drop for RodioBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Driver code for a call that is invalid in the voice's current state.
pub const DRIVER_INVALID_OPERATION: u32 = 0xA004;
