//! One playback of one cache on one voice.
//!
//! A player owns its voice from creation until the engine's reap pass returns
//! the voice to the pool. Hardware playback only starts once the cache is
//! ready; until then control calls update the stored parameters.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use cadence_common::{AudioId, SourceId};
use cadence_kernel::{VoiceBackend, VoiceFeed, VoiceParams, VoiceState};

use crate::audio_cache::AudioCache;

/// Invoked once when a player finishes on its own, with its id and file path.
pub type FinishCallback = Box<dyn FnOnce(AudioId, &str) + Send + 'static>;

/// Public view of a live player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioState {
    /// Waiting for its cache to decode.
    Initializing,
    /// Playing.
    Playing,
    /// Paused.
    Paused,
}

/// Lifecycle of a player's voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerPhase {
    /// Voice reserved, nothing started yet.
    Created,
    /// Voice started.
    Playing,
    /// Voice paused.
    Paused,
    /// Voice released back to the pool.
    Finished,
}

/// Result of reaping a player.
pub(crate) struct Reaped {
    /// Set when the player finished naturally and had a callback.
    pub finish_callback: Option<FinishCallback>,
}

struct PlayerState {
    cache: Weak<AudioCache>,
    looping: bool,
    volume: f32,
    streaming: bool,
    ready: bool,
    duration: Option<f32>,
    phase: PlayerPhase,
    remove_requested: bool,
    released: bool,
    finish_callback: Option<FinishCallback>,
}

/// Binding of one cache to one voice.
pub struct AudioPlayer {
    id: AudioId,
    file_path: String,
    source: SourceId,
    state: Mutex<PlayerState>,
}

impl std::fmt::Debug for AudioPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AudioPlayer")
            .field("id", &self.id)
            .field("file_path", &self.file_path)
            .field("source", &self.source)
            .field("phase", &state.phase)
            .field("ready", &state.ready)
            .field("remove_requested", &state.remove_requested)
            .finish_non_exhaustive()
    }
}

impl AudioPlayer {
    /// Create a player for `cache` on `source`.
    #[must_use]
    pub fn new(
        id: AudioId,
        file_path: impl Into<String>,
        source: SourceId,
        cache: &Arc<AudioCache>,
        looping: bool,
        volume: f32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            file_path: file_path.into(),
            source,
            state: Mutex::new(PlayerState {
                cache: Arc::downgrade(cache),
                looping,
                volume,
                streaming: false,
                ready: false,
                duration: None,
                phase: PlayerPhase::Created,
                remove_requested: false,
                released: false,
                finish_callback: None,
            }),
        })
    }

    /// Player id.
    #[must_use]
    pub fn id(&self) -> AudioId {
        self.id
    }

    /// Path the player was started with.
    #[must_use]
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Voice the player owns.
    #[must_use]
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Check if the voice has been started.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Check if the player is waiting to be reaped.
    #[must_use]
    pub fn is_remove_requested(&self) -> bool {
        self.state.lock().remove_requested
    }

    /// Public state.
    #[must_use]
    pub fn audio_state(&self) -> AudioState {
        let state = self.state.lock();
        match (state.ready, state.phase) {
            (false, _) => AudioState::Initializing,
            (true, PlayerPhase::Paused) => AudioState::Paused,
            (true, _) => AudioState::Playing,
        }
    }

    /// The cache this player plays, if it is still cached.
    #[must_use]
    pub fn cache(&self) -> Option<Arc<AudioCache>> {
        self.state.lock().cache.upgrade()
    }

    /// Check if the player plays `cache`.
    #[must_use]
    pub fn is_bound_to(&self, cache: &Arc<AudioCache>) -> bool {
        std::ptr::eq(self.state.lock().cache.as_ptr(), Arc::as_ptr(cache))
    }

    /// Forget the cache; the voice keeps whatever it was already fed.
    pub fn clear_cache(&self) {
        self.state.lock().cache = Weak::new();
    }

    /// Flag the player for the next reap pass.
    pub fn request_removal(&self) {
        self.state.lock().remove_requested = true;
    }

    /// Replace the finish callback.
    pub fn set_finish_callback(&self, callback: FinishCallback) {
        self.state.lock().finish_callback = Some(callback);
    }

    /// Start the voice with `feed`. Returns `false` if the player was removed
    /// meanwhile or the driver refused.
    pub fn start(&self, backend: &dyn VoiceBackend, feed: VoiceFeed) -> bool {
        let mut state = self.state.lock();
        if state.released || state.remove_requested {
            return false;
        }
        if state.ready {
            warn!("{} started twice", self.id);
            return false;
        }

        let streaming = feed.is_streamed();
        let duration = feed.duration_secs();
        let params = VoiceParams {
            volume: state.volume,
            looping: state.looping,
        };

        match backend.play(self.source, feed, params) {
            Ok(()) => {
                state.ready = true;
                state.streaming = streaming;
                state.duration = duration;
                if state.phase == PlayerPhase::Created {
                    state.phase = PlayerPhase::Playing;
                } else if state.phase == PlayerPhase::Paused {
                    // Paused before the cache was ready.
                    if let Err(e) = backend.pause(self.source) {
                        error!("{} pause after start failed: {e}", self.id);
                    }
                }
                debug!("{} started on {}", self.id, self.source);
                true
            },
            Err(e) => {
                error!("{} failed to start on {}: {e}", self.id, self.source);
                state.remove_requested = true;
                false
            },
        }
    }

    /// Set the volume.
    pub fn set_volume(&self, backend: &dyn VoiceBackend, volume: f32) -> bool {
        let mut state = self.state.lock();
        state.volume = volume;
        if !state.ready || state.released {
            return true;
        }
        backend
            .set_volume(self.source, volume)
            .map_err(|e| error!("{} set_volume failed: {e}", self.id))
            .is_ok()
    }

    /// Set looping.
    pub fn set_loop(&self, backend: &dyn VoiceBackend, looping: bool) -> bool {
        let mut state = self.state.lock();
        state.looping = looping;
        if !state.ready || state.released {
            return true;
        }
        backend
            .set_looping(self.source, looping)
            .map_err(|e| error!("{} set_loop failed: {e}", self.id))
            .is_ok()
    }

    /// Pause the voice.
    pub fn pause(&self, backend: &dyn VoiceBackend) -> bool {
        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        match backend.pause(self.source) {
            Ok(()) => {
                state.phase = PlayerPhase::Paused;
                true
            },
            Err(e) => {
                error!("{} pause failed: {e}", self.id);
                false
            },
        }
    }

    /// Resume the voice.
    pub fn resume(&self, backend: &dyn VoiceBackend) -> bool {
        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        match backend.resume(self.source) {
            Ok(()) => {
                state.phase = if state.ready {
                    PlayerPhase::Playing
                } else {
                    PlayerPhase::Created
                };
                true
            },
            Err(e) => {
                error!("{} resume failed: {e}", self.id);
                false
            },
        }
    }

    /// Playback position in seconds; 0.0 until the voice has started.
    pub fn current_time(&self, backend: &dyn VoiceBackend) -> f32 {
        let state = self.state.lock();
        if !state.ready || state.released {
            return 0.0;
        }
        backend.offset(self.source).unwrap_or_else(|e| {
            error!("{} offset query failed: {e}", self.id);
            0.0
        })
    }

    /// Seek to `seconds`.
    pub fn set_current_time(&self, backend: &dyn VoiceBackend, seconds: f32) -> bool {
        let state = self.state.lock();
        if !state.ready || state.released {
            return false;
        }
        if !state.streaming {
            if let Some(cache) = state.cache.upgrade() {
                if !cache.can_seek_to(seconds) {
                    warn!(
                        "{} cannot seek to {seconds:.2}s; only {} frames decoded",
                        self.id,
                        cache.frames_read()
                    );
                    return false;
                }
            }
        }
        backend
            .set_offset(self.source, seconds)
            .map_err(|e| error!("{} seek failed: {e}", self.id))
            .is_ok()
    }

    /// Length in seconds, once the voice has started and if known.
    #[must_use]
    pub fn duration(&self) -> Option<f32> {
        let state = self.state.lock();
        if state.ready {
            state.duration
        } else {
            None
        }
    }

    /// Release the voice if the player was removed or finished on its own.
    ///
    /// Called by the reap pass. After this returns `Some`, control calls no
    /// longer touch the voice.
    pub(crate) fn reap(&self, backend: Option<&dyn VoiceBackend>) -> Option<Reaped> {
        let mut state = self.state.lock();
        if state.released {
            return Some(Reaped {
                finish_callback: None,
            });
        }

        let finish_callback = if state.remove_requested {
            if let Some(backend) = backend {
                if let Err(e) = backend.stop(self.source) {
                    error!("{} stop failed: {e}", self.id);
                }
            }
            None
        } else if state.ready {
            let backend = backend?;
            match backend.voice_state(self.source) {
                Ok(VoiceState::Stopped) => state.finish_callback.take(),
                Ok(_) => return None,
                Err(e) => {
                    error!("{} state query failed: {e}", self.id);
                    return None;
                },
            }
        } else {
            return None;
        };

        state.released = true;
        state.phase = PlayerPhase::Finished;
        state.cache = Weak::new();
        Some(Reaped { finish_callback })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::CacheId;
    use cadence_kernel::{PcmBuffer, SimulatedBackend};

    struct Fixture {
        backend: SimulatedBackend,
        cache: Arc<AudioCache>,
        voice: SourceId,
    }

    fn fixture() -> Fixture {
        let backend = SimulatedBackend::new();
        let voice = backend.allocate_voices(1).expect("allocate")[0];
        Fixture {
            backend,
            cache: AudioCache::new(CacheId::new(1), "a.wav", "a.wav"),
            voice,
        }
    }

    fn clip() -> VoiceFeed {
        VoiceFeed::Buffered(Arc::new(PcmBuffer::new(10, 1, vec![0.0; 20])))
    }

    #[test]
    fn test_start_applies_stored_parameters() {
        let f = fixture();
        let player = AudioPlayer::new(AudioId::from_raw(1), "a.wav", f.voice, &f.cache, false, 1.0);

        assert!(player.set_volume(&f.backend, 0.3));
        assert!(player.set_loop(&f.backend, true));
        assert_eq!(player.audio_state(), AudioState::Initializing);
        assert_eq!(player.current_time(&f.backend), 0.0);
        assert!(player.duration().is_none());

        assert!(player.start(&f.backend, clip()));
        let voice = f.backend.voice(f.voice).expect("voice");
        assert!((voice.volume - 0.3).abs() < f32::EPSILON);
        assert!(voice.looping);
        assert_eq!(player.audio_state(), AudioState::Playing);
        assert_eq!(player.duration(), Some(2.0));
    }

    #[test]
    fn test_pause_before_ready_holds_voice() {
        let f = fixture();
        let player = AudioPlayer::new(AudioId::from_raw(1), "a.wav", f.voice, &f.cache, false, 1.0);

        assert!(player.pause(&f.backend));
        assert!(player.start(&f.backend, clip()));
        assert_eq!(f.backend.voice_state(f.voice).expect("state"), VoiceState::Paused);
        assert_eq!(player.audio_state(), AudioState::Paused);

        assert!(player.resume(&f.backend));
        assert_eq!(player.audio_state(), AudioState::Playing);
    }

    #[test]
    fn test_reap_natural_finish_takes_callback() {
        let f = fixture();
        let player = AudioPlayer::new(AudioId::from_raw(7), "a.wav", f.voice, &f.cache, false, 1.0);
        player.set_finish_callback(Box::new(|id: AudioId, path: &str| {
            assert_eq!(id, AudioId::from_raw(7));
            assert_eq!(path, "a.wav");
        }));
        assert!(player.start(&f.backend, clip()));

        assert!(player.reap(Some(&f.backend)).is_none());
        f.backend.advance(3.0);

        let reaped = player.reap(Some(&f.backend)).expect("finished");
        let callback = reaped.finish_callback.expect("callback");
        callback(player.id(), player.file_path());

        assert_eq!(player.state.lock().phase, PlayerPhase::Finished);
        assert!(player.cache().is_none());
        assert!(!player.pause(&f.backend));
    }

    #[test]
    fn test_reap_removed_player_stops_voice() {
        let f = fixture();
        let player = AudioPlayer::new(AudioId::from_raw(1), "a.wav", f.voice, &f.cache, true, 1.0);
        player.set_finish_callback(Box::new(|_: AudioId, _: &str| {
            panic!("removed players do not finish")
        }));
        assert!(player.start(&f.backend, clip()));

        player.request_removal();
        let reaped = player.reap(Some(&f.backend)).expect("removed");
        assert!(reaped.finish_callback.is_none());
        assert_eq!(f.backend.voice_state(f.voice).expect("state"), VoiceState::Stopped);
        assert!(!player.start(&f.backend, clip()));
    }

    #[test]
    fn test_driver_failure_flags_removal() {
        let f = fixture();
        let player = AudioPlayer::new(AudioId::from_raw(1), "a.wav", f.voice, &f.cache, false, 1.0);
        f.backend.set_fault(Some(0xA003));

        assert!(!player.start(&f.backend, clip()));
        assert!(player.is_remove_requested());
        assert!(!player.pause(&f.backend));
    }

    #[test]
    fn test_cache_binding() {
        let f = fixture();
        let other = AudioCache::new(CacheId::new(2), "b.wav", "b.wav");
        let player = AudioPlayer::new(AudioId::from_raw(1), "a.wav", f.voice, &f.cache, false, 1.0);

        assert!(player.is_bound_to(&f.cache));
        assert!(!player.is_bound_to(&other));
        player.clear_cache();
        assert!(!player.is_bound_to(&f.cache));
    }
}
