//! Audio engine: caches, players and voice allocation.
//!
//! The engine owns a voice backend, a fixed pool of voices and the table of
//! live players. Every request that plays a file goes through here:
//!
//! 1. Resolve or create the file's [`AudioCache`]; new caches decode on the
//!    decode pool.
//! 2. Take a voice from the pool and register an [`AudioPlayer`] for it under
//!    a fresh [`AudioId`].
//! 3. Start the voice once the cache is ready.
//!
//! While any player is registered, a reap pass runs on the [`Scheduler`]. It
//! returns the voices of finished or stopped players to the pool and then
//! calls finish callbacks.
//!
//! # Locking
//!
//! The player table, voice pool and cache table share one non-reentrant lock.
//! Nothing that can call back into the engine runs under it: cache callbacks,
//! finish callbacks and cache destruction all happen after it is released.
//! Control calls look a player up under the lock and drive its voice after
//! releasing it; the player's own lock keeps the reap pass from recycling the
//! voice mid-call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use cadence_common::{AudioError, AudioId, AudioResult, CacheId};
use cadence_kernel::{AudioDecoder, RodioBackend, RodioDecoder, SourcePool, VoiceBackend};

use crate::audio_cache::{AudioCache, CacheOutcome};
use crate::audio_player::{AudioPlayer, AudioState};
use crate::config::EngineConfig;
use crate::scheduler::{ScheduleKey, Scheduler};
use crate::task_pool::TaskPool;

/// Returned by [`AudioEngine::duration`] when the length is not known.
pub const TIME_UNKNOWN: f32 = -1.0;

struct EngineState {
    players: HashMap<AudioId, Arc<AudioPlayer>>,
    pool: SourcePool,
    caches: HashMap<String, Arc<AudioCache>>,
    last_id: AudioId,
    last_cache_id: u32,
    update_key: Option<ScheduleKey>,
    closed: bool,
}

struct EngineInner {
    config: EngineConfig,
    backend: RwLock<Option<Arc<dyn VoiceBackend>>>,
    decoder: Arc<dyn AudioDecoder>,
    tasks: TaskPool,
    scheduler: Arc<Scheduler>,
    state: Mutex<EngineState>,
}

impl EngineInner {
    fn backend(&self) -> Option<Arc<dyn VoiceBackend>> {
        self.backend.read().clone()
    }

    fn player(&self, id: AudioId) -> Option<(Arc<AudioPlayer>, Arc<dyn VoiceBackend>)> {
        let player = self.state.lock().players.get(&id).cloned()?;
        Some((player, self.backend()?))
    }

    fn update(&self, dt: f32) {
        trace!("Audio update after {dt:.3}s");
        self.reap();
    }

    /// Release finished and removed players, then run finish callbacks.
    fn reap(&self) {
        let backend = self.backend();
        let finished = {
            let mut state = self.state.lock();
            let mut reaped = Vec::new();
            let mut finished = Vec::new();

            for (id, player) in &state.players {
                if let Some(result) = player.reap(backend.as_deref()) {
                    reaped.push(*id);
                    if let Some(callback) = result.finish_callback {
                        finished.push((*id, player.file_path().to_string(), callback));
                    }
                }
            }

            for id in reaped {
                if let Some(player) = state.players.remove(&id) {
                    state.pool.release(player.source());
                    debug!("{} released {}", id, player.source());
                }
            }

            if state.players.is_empty() {
                if let Some(key) = state.update_key.take() {
                    self.scheduler.unschedule(key);
                    debug!("No players left; audio update disarmed");
                }
            }
            finished
        };

        for (id, path, callback) in finished {
            callback(id, &path);
        }
    }

    /// Start or discard a player once its cache has settled.
    fn on_cache_ready(&self, id: AudioId, outcome: CacheOutcome) {
        let Some(player) = self.state.lock().players.get(&id).cloned() else {
            debug!("{} gone before its cache settled", id);
            return;
        };

        let started = match (outcome, self.backend(), player.cache()) {
            (CacheOutcome::Ready, Some(backend), Some(cache)) => match cache.feed(&self.decoder) {
                Some(feed) => player.start(backend.as_ref(), feed),
                None => false,
            },
            _ => false,
        };

        if !started && !player.is_ready() {
            debug!("{} will be removed ({:?})", id, outcome);
            player.request_removal();
        }
    }
}

/// Plays audio files on a fixed set of voices.
///
/// Dropping the engine shuts it down.
pub struct AudioEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (in_use, capacity) = self.source_usage();
        f.debug_struct("AudioEngine")
            .field("initialized", &self.is_initialized())
            .field("players", &self.playing_count())
            .field("voices_in_use", &in_use)
            .field("voices", &capacity)
            .finish_non_exhaustive()
    }
}

impl AudioEngine {
    /// Create an engine decoding files with rodio.
    #[must_use]
    pub fn new(config: EngineConfig, scheduler: Arc<Scheduler>) -> Self {
        Self::with_decoder(config, scheduler, Arc::new(RodioDecoder::new()))
    }

    /// Create an engine with a custom decoder.
    #[must_use]
    pub fn with_decoder(
        mut config: EngineConfig,
        scheduler: Arc<Scheduler>,
        decoder: Arc<dyn AudioDecoder>,
    ) -> Self {
        config.validate();
        let tasks = TaskPool::new(config.decode_workers, "cadence-decode");
        Self {
            inner: Arc::new(EngineInner {
                config,
                backend: RwLock::new(None),
                decoder,
                tasks,
                scheduler,
                state: Mutex::new(EngineState {
                    players: HashMap::new(),
                    pool: SourcePool::default(),
                    caches: HashMap::new(),
                    last_id: AudioId::INVALID,
                    last_cache_id: 0,
                    update_key: None,
                    closed: false,
                }),
            }),
        }
    }

    /// Open the default output device.
    pub fn init(&self) -> bool {
        self.init_with(|| RodioBackend::open().map(|backend| Arc::new(backend) as Arc<dyn VoiceBackend>))
    }

    /// Open a device with `open` and allocate the configured voices.
    ///
    /// Returns `false` if the device or any voice cannot be obtained; the
    /// engine then stays without a device and every `play` fails.
    pub fn init_with<F>(&self, open: F) -> bool
    where
        F: FnOnce() -> AudioResult<Arc<dyn VoiceBackend>>,
    {
        if self.is_initialized() {
            warn!("Audio engine already initialized");
            return true;
        }
        if self.inner.state.lock().closed {
            warn!("Audio engine was shut down and cannot be initialized again");
            return false;
        }

        let backend = match open() {
            Ok(backend) => backend,
            Err(e) => {
                error!("Failed to open audio device: {e}");
                return false;
            },
        };

        let voices = match backend.allocate_voices(self.inner.config.max_instances) {
            Ok(voices) => voices,
            Err(e) => {
                error!("Failed to allocate audio voices: {e}");
                backend.shutdown();
                return false;
            },
        };

        let mut state = self.inner.state.lock();
        state.pool = SourcePool::new(voices);
        info!(
            "Audio engine initialized on {} backend with {} voices",
            backend.name(),
            state.pool.capacity()
        );
        *self.inner.backend.write() = Some(backend);
        true
    }

    /// Check if a device is open.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.backend.read().is_some()
    }

    /// Engine configuration after validation.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Scheduler the reap pass runs on.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    /// Decode `path` ahead of playback.
    ///
    /// `callback` runs once with `true` when the file is ready and `false` if
    /// it fails or is uncached first. Returns the shared cache for the path.
    pub fn preload(
        &self,
        path: &str,
        callback: impl FnOnce(bool) + Send + 'static,
    ) -> Option<Arc<AudioCache>> {
        let key = normalize_path(path);
        if key.is_empty() || !self.is_initialized() {
            warn!("Cannot preload '{path}'");
            callback(false);
            return None;
        }

        let (cache, created) = {
            let mut state = self.inner.state.lock();
            self.cache_for(&mut state, &key)
        };
        if created {
            self.dispatch_decode(&cache);
        }
        cache.add_load_callback(Box::new(callback));
        Some(cache)
    }

    /// Play `path` on a free voice.
    ///
    /// Returns [`AudioId::INVALID`] if the engine has no device, the path is
    /// empty or every voice is busy. `volume` is clamped to `0.0..=1.0`.
    pub fn play(&self, path: &str, looping: bool, volume: f32) -> AudioId {
        let key = normalize_path(path);
        if key.is_empty() {
            warn!("play called with an empty path");
            return AudioId::INVALID;
        }
        if !self.is_initialized() {
            warn!("Cannot play '{key}' without an audio device");
            return AudioId::INVALID;
        }
        let volume = volume.clamp(0.0, 1.0);

        let (id, cache, created) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return AudioId::INVALID;
            }
            let Some(source) = state.pool.acquire() else {
                warn!("No free voice to play '{key}'");
                return AudioId::INVALID;
            };

            let (cache, created) = self.cache_for(&mut state, &key);

            let mut id = state.last_id.next();
            if !id.is_valid() {
                id = id.next();
            }
            state.last_id = id;

            let player = AudioPlayer::new(id, key.clone(), source, &cache, looping, volume);
            state.players.insert(id, player);

            if state.update_key.is_none() {
                state.update_key = Some(self.arm_update());
            }
            debug!("{} plays '{}' on {}", id, key, source);
            (id, cache, created)
        };

        if created {
            self.dispatch_decode(&cache);
        }

        let engine = Arc::downgrade(&self.inner);
        cache.add_play_callback(Box::new(move |outcome| {
            if let Some(engine) = engine.upgrade() {
                engine.on_cache_ready(id, outcome);
            }
        }));
        id
    }

    /// Set a player's volume.
    pub fn set_volume(&self, id: AudioId, volume: f32) -> bool {
        self.inner
            .player(id)
            .is_some_and(|(player, backend)| player.set_volume(backend.as_ref(), volume.clamp(0.0, 1.0)))
    }

    /// Set whether a player loops.
    pub fn set_loop(&self, id: AudioId, looping: bool) -> bool {
        self.inner
            .player(id)
            .is_some_and(|(player, backend)| player.set_loop(backend.as_ref(), looping))
    }

    /// Pause a player.
    pub fn pause(&self, id: AudioId) -> bool {
        self.inner
            .player(id)
            .is_some_and(|(player, backend)| player.pause(backend.as_ref()))
    }

    /// Resume a paused player.
    pub fn resume(&self, id: AudioId) -> bool {
        self.inner
            .player(id)
            .is_some_and(|(player, backend)| player.resume(backend.as_ref()))
    }

    /// Pause every player.
    pub fn pause_all(&self) {
        for id in self.player_ids() {
            self.pause(id);
        }
    }

    /// Resume every player.
    pub fn resume_all(&self) {
        for id in self.player_ids() {
            self.resume(id);
        }
    }

    /// Stop a player and release its voice now. No finish callback runs.
    pub fn stop(&self, id: AudioId) -> bool {
        let found = match self.inner.state.lock().players.get(&id) {
            Some(player) => {
                player.request_removal();
                true
            },
            None => false,
        };
        if found {
            self.inner.reap();
        }
        found
    }

    /// Stop every player.
    pub fn stop_all(&self) {
        for player in self.inner.state.lock().players.values() {
            player.request_removal();
        }
        self.inner.reap();
    }

    /// Playback position in seconds, or 0.0 for unknown or not yet started ids.
    #[must_use]
    pub fn current_time(&self, id: AudioId) -> f32 {
        self.inner
            .player(id)
            .map_or(0.0, |(player, backend)| player.current_time(backend.as_ref()))
    }

    /// Seek a player to `seconds`.
    pub fn set_current_time(&self, id: AudioId, seconds: f32) -> bool {
        self.inner
            .player(id)
            .is_some_and(|(player, backend)| player.set_current_time(backend.as_ref(), seconds))
    }

    /// Length of a player's audio, or [`TIME_UNKNOWN`].
    #[must_use]
    pub fn duration(&self, id: AudioId) -> f32 {
        self.inner
            .state
            .lock()
            .players
            .get(&id)
            .and_then(|player| player.duration())
            .unwrap_or(TIME_UNKNOWN)
    }

    /// Run `callback` when the player finishes on its own.
    pub fn set_finish_callback(
        &self,
        id: AudioId,
        callback: impl FnOnce(AudioId, &str) + Send + 'static,
    ) -> bool {
        match self.inner.state.lock().players.get(&id) {
            Some(player) => {
                player.set_finish_callback(Box::new(callback));
                true
            },
            None => false,
        }
    }

    /// State of a live player.
    #[must_use]
    pub fn state(&self, id: AudioId) -> Option<AudioState> {
        self.inner
            .state
            .lock()
            .players
            .get(&id)
            .map(|player| player.audio_state())
    }

    /// Number of registered players.
    #[must_use]
    pub fn playing_count(&self) -> usize {
        self.inner.state.lock().players.len()
    }

    /// Voices in use and total voices.
    #[must_use]
    pub fn source_usage(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.pool.in_use(), state.pool.capacity())
    }

    /// The cache for `path`, if one exists.
    #[must_use]
    pub fn cache(&self, path: &str) -> Option<Arc<AudioCache>> {
        self.inner
            .state
            .lock()
            .caches
            .get(&normalize_path(path))
            .cloned()
    }

    /// Number of cached files.
    #[must_use]
    pub fn cache_count(&self) -> usize {
        self.inner.state.lock().caches.len()
    }

    /// Drop the cache for `path`. Players already playing it keep playing.
    pub fn uncache(&self, path: &str) {
        let key = normalize_path(path);
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.caches.remove(&key);
            if let Some(cache) = &removed {
                for player in state.players.values() {
                    if player.is_bound_to(cache) {
                        player.clear_cache();
                    }
                }
            }
            removed
        };

        if let Some(cache) = removed {
            cache.destroy();
            info!("Uncached '{}'", key);
        }
    }

    /// Drop every cache.
    pub fn uncache_all(&self) {
        let removed: Vec<Arc<AudioCache>> = {
            let mut state = self.inner.state.lock();
            for player in state.players.values() {
                player.clear_cache();
            }
            state.caches.drain().map(|(_, cache)| cache).collect()
        };

        for cache in &removed {
            cache.destroy();
        }
        info!("Uncached {} files", removed.len());
    }

    /// Run one reap pass now.
    pub fn update(&self, dt: f32) {
        self.inner.update(dt);
    }

    /// Stop all players, destroy every cache and close the device.
    ///
    /// The engine cannot be used afterwards.
    pub fn shutdown(&self) {
        let backend = self.inner.backend();
        let caches: Vec<Arc<AudioCache>> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            if let Some(key) = state.update_key.take() {
                self.inner.scheduler.unschedule(key);
            }

            let players: Vec<Arc<AudioPlayer>> = state.players.drain().map(|(_, p)| p).collect();
            for player in players {
                player.request_removal();
                player.reap(backend.as_deref());
                state.pool.release(player.source());
            }
            state.caches.drain().map(|(_, cache)| cache).collect()
        };

        for cache in caches {
            cache.destroy();
        }
        self.inner.tasks.shutdown();

        if let Some(backend) = self.inner.backend.write().take() {
            backend.shutdown();
        }
        info!("Audio engine shut down");
    }

    fn player_ids(&self) -> Vec<AudioId> {
        self.inner.state.lock().players.keys().copied().collect()
    }

    fn resolve(&self, key: &str) -> PathBuf {
        let path = Path::new(key);
        match &self.inner.config.asset_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Look up or create the cache for `key`. Returns `true` if created.
    fn cache_for(&self, state: &mut EngineState, key: &str) -> (Arc<AudioCache>, bool) {
        if let Some(cache) = state.caches.get(key) {
            return (Arc::clone(cache), false);
        }
        state.last_cache_id += 1;
        let cache = AudioCache::new(CacheId::new(state.last_cache_id), key, self.resolve(key));
        debug!("{} created for '{}'", cache.id(), key);
        state.caches.insert(key.to_string(), Arc::clone(&cache));
        (cache, true)
    }

    fn dispatch_decode(&self, cache: &Arc<AudioCache>) {
        cache.mark_loading();
        let job = Arc::clone(cache);
        let decoder = Arc::clone(&self.inner.decoder);
        let max_buffered_bytes = self.inner.config.max_buffered_bytes;
        if !self
            .inner
            .tasks
            .spawn(move || job.load(decoder.as_ref(), max_buffered_bytes))
        {
            cache.fail(AudioError::DecodeFailed("decode pool is shut down".to_string()));
        }
    }

    fn arm_update(&self) -> ScheduleKey {
        let engine = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(
            self.inner.config.update_interval(),
            Arc::new(move |dt| {
                if let Some(engine) = engine.upgrade() {
                    engine.update(dt);
                }
            }),
        )
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Normalize a path lexically: unify separators to `/`, drop `.` and empty
/// components and collapse `dir/..`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with(['/', '\\']);
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {},
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                },
                _ if absolute => {},
                _ => parts.push(".."),
            },
            part => parts.push(part),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::SourceId;
    use cadence_kernel::{MemoryDecoder, PcmBuffer, PcmFormat, SimulatedBackend, VoiceState};
    use crossbeam_channel::{bounded, unbounded};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Longer than the update interval so every tick reaps.
    const TICK: f32 = 0.1;

    fn clip(seconds: f32) -> PcmBuffer {
        PcmBuffer::new(10, 1, vec![0.0; (seconds * 10.0) as usize])
    }

    struct Harness {
        engine: AudioEngine,
        backend: Arc<SimulatedBackend>,
        decoder: Arc<MemoryDecoder>,
        scheduler: Arc<Scheduler>,
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("sfx/a.wav", clip(2.0));
        decoder.insert("sfx/b.wav", clip(2.0));
        decoder.insert("sfx/c.wav", clip(1.0));
        decoder.insert("music/theme.ogg", clip(60.0));
        decoder.insert_broken("sfx/broken.wav", "bad header");

        let scheduler = Arc::new(Scheduler::new());
        let engine = AudioEngine::with_decoder(
            config,
            Arc::clone(&scheduler),
            Arc::clone(&decoder) as Arc<dyn AudioDecoder>,
        );

        let backend = Arc::new(SimulatedBackend::new());
        let device = Arc::clone(&backend);
        assert!(engine.init_with(move || Ok(device as Arc<dyn VoiceBackend>)));

        Harness {
            engine,
            backend,
            decoder,
            scheduler,
        }
    }

    fn harness(voices: usize) -> Harness {
        harness_with(EngineConfig {
            max_instances: voices,
            ..EngineConfig::default()
        })
    }

    impl Harness {
        fn preload(&self, path: &str) -> bool {
            let (tx, rx) = bounded(1);
            self.engine.preload(path, move |ok| {
                let _ = tx.send(ok);
            });
            rx.recv_timeout(Duration::from_secs(5))
                .expect("preload settled")
        }

        fn play_ready(&self, path: &str) -> AudioId {
            assert!(self.preload(path));
            self.engine.play(path, false, 1.0)
        }

        fn source_of(&self, id: AudioId) -> Option<SourceId> {
            self.engine
                .inner
                .state
                .lock()
                .players
                .get(&id)
                .map(|player| player.source())
        }

        fn tick(&self) {
            self.scheduler.tick(TICK);
        }

        fn wait_for(&self, what: &str, condition: impl Fn() -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !condition() {
                assert!(Instant::now() < deadline, "timed out waiting for {what}");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("sfx/a.wav"), "sfx/a.wav");
        assert_eq!(normalize_path("./sfx//a.wav"), "sfx/a.wav");
        assert_eq!(normalize_path("sfx\\ui\\..\\a.wav"), "sfx/a.wav");
        assert_eq!(normalize_path("../shared/a.wav"), "../shared/a.wav");
        assert_eq!(normalize_path("/abs/../a.wav"), "/a.wav");
        assert_eq!(normalize_path("/../a.wav"), "/a.wav");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_init_failure_leaves_engine_unusable() {
        let engine = AudioEngine::with_decoder(
            EngineConfig::default(),
            Arc::new(Scheduler::new()),
            Arc::new(MemoryDecoder::new()),
        );
        assert!(!engine.init_with(|| Err(AudioError::NoDevice)));
        assert!(!engine.is_initialized());
        assert_eq!(engine.play("sfx/a.wav", false, 1.0), AudioId::INVALID);

        let limited = Arc::new(SimulatedBackend::with_voice_limit(4));
        let engine = AudioEngine::with_decoder(
            EngineConfig {
                max_instances: 8,
                ..EngineConfig::default()
            },
            Arc::new(Scheduler::new()),
            Arc::new(MemoryDecoder::new()),
        );
        let device = Arc::clone(&limited);
        assert!(!engine.init_with(move || Ok(device as Arc<dyn VoiceBackend>)));
        assert!(limited.is_shut_down());
        assert_eq!(engine.source_usage(), (0, 0));
    }

    #[test]
    fn test_play_finish_and_reap() {
        let h = harness(4);
        let id = h.play_ready("sfx/a.wav");
        assert!(id.is_valid());
        assert_eq!(h.engine.state(id), Some(AudioState::Playing));
        assert_eq!(h.engine.source_usage(), (1, 4));
        assert!((h.engine.duration(id) - 2.0).abs() < 1e-6);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&calls);
        assert!(h.engine.set_finish_callback(id, move |id, path| {
            log.lock().push((id, path.to_string()));
        }));

        h.backend.advance(1.0);
        h.tick();
        assert_eq!(h.engine.playing_count(), 1);

        h.backend.advance(1.5);
        h.tick();
        h.tick();
        assert_eq!(h.engine.playing_count(), 0);
        assert_eq!(h.engine.source_usage(), (0, 4));
        assert_eq!(*calls.lock(), vec![(id, "sfx/a.wav".to_string())]);
        assert!(h.scheduler.is_empty());
    }

    #[test]
    fn test_voice_exhaustion_and_reuse() {
        let h = harness(2);
        let a = h.play_ready("sfx/a.wav");
        let b = h.play_ready("sfx/b.wav");
        assert!(a.is_valid() && b.is_valid());

        let source_a = h.source_of(a).expect("a registered");
        let source_b = h.source_of(b).expect("b registered");
        assert_ne!(source_a, source_b);

        assert!(h.preload("sfx/c.wav"));
        assert_eq!(h.engine.play("sfx/c.wav", false, 1.0), AudioId::INVALID);

        h.backend.finish(source_a);
        h.tick();
        assert!(h.engine.state(a).is_none());

        let c = h.engine.play("sfx/c.wav", false, 1.0);
        assert!(c.is_valid());
        assert_eq!(h.source_of(c), Some(source_a));
        assert!(c > b);
    }

    #[test]
    fn test_stale_ids_return_neutral_values() {
        let h = harness(2);
        let stale = AudioId::from_raw(99);

        for id in [AudioId::INVALID, stale] {
            assert!(!h.engine.pause(id));
            assert!(!h.engine.resume(id));
            assert!(!h.engine.stop(id));
            assert!(!h.engine.set_volume(id, 0.5));
            assert!(!h.engine.set_loop(id, true));
            assert!(!h.engine.set_current_time(id, 1.0));
            assert!(!h.engine.set_finish_callback(id, |_, _| {}));
            assert_eq!(h.engine.current_time(id), 0.0);
            assert_eq!(h.engine.duration(id), TIME_UNKNOWN);
            assert!(h.engine.state(id).is_none());
        }
    }

    #[test]
    fn test_stop_releases_voice_without_finish_callback() {
        let h = harness(2);
        let id = h.play_ready("sfx/a.wav");
        let source = h.source_of(id).expect("registered");
        h.engine
            .set_finish_callback(id, |_, _| panic!("stopped players do not finish"));
        h.backend.advance(0.5);

        assert!(h.engine.stop(id));
        assert_eq!(h.engine.current_time(id), 0.0);
        assert_eq!(h.engine.source_usage(), (0, 2));
        assert_eq!(
            h.backend.voice_state(source).expect("state"),
            VoiceState::Stopped
        );
        assert!(!h.engine.stop(id));
    }

    #[test]
    fn test_concurrent_preloads_share_one_decode() {
        let h = harness(4);
        h.decoder.hold();

        let settled = Arc::new(AtomicUsize::new(0));
        let first = {
            let settled = Arc::clone(&settled);
            h.engine
                .preload("sfx/a.wav", move |ok| {
                    assert!(ok);
                    settled.fetch_add(1, Ordering::SeqCst);
                })
                .expect("cache")
        };
        let second = {
            let settled = Arc::clone(&settled);
            h.engine
                .preload("./sfx/a.wav", move |ok| {
                    assert!(ok);
                    settled.fetch_add(1, Ordering::SeqCst);
                })
                .expect("cache")
        };
        let id = h.engine.play("sfx/a.wav", false, 1.0);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.engine.cache_count(), 1);
        assert_eq!(h.engine.state(id), Some(AudioState::Initializing));

        h.decoder.release();
        h.wait_for("both preloads", || settled.load(Ordering::SeqCst) == 2);
        h.wait_for("playback", || h.engine.state(id) == Some(AudioState::Playing));
        assert_eq!(h.decoder.open_count("sfx/a.wav"), 1);
    }

    #[test]
    fn test_finish_callback_can_play_again() {
        let h = harness(1);
        let engine = Arc::new(h.engine);
        assert!({
            let (tx, rx) = bounded(1);
            engine.preload("sfx/c.wav", move |ok| {
                let _ = tx.send(ok);
            });
            rx.recv_timeout(Duration::from_secs(5)).expect("preload")
        });

        let first = engine.play("sfx/c.wav", false, 1.0);
        let (tx, rx) = unbounded();
        let weak = Arc::downgrade(&engine);
        engine.set_finish_callback(first, move |_, path| {
            if let Some(engine) = weak.upgrade() {
                let _ = tx.send(engine.play(path, false, 1.0));
            }
        });

        h.backend.advance(2.0);
        h.scheduler.tick(TICK);

        let second = rx.try_recv().expect("finish callback ran");
        assert!(second.is_valid());
        assert_ne!(first, second);
        assert_eq!(engine.state(second), Some(AudioState::Playing));
        assert_eq!(engine.source_usage(), (1, 1));
        assert!(!h.scheduler.is_empty());
    }

    #[test]
    fn test_uncache_all_detaches_players() {
        let h = harness(2);
        let id = h.play_ready("sfx/a.wav");
        let cache = h.engine.cache("sfx/a.wav").expect("cached");

        h.engine.uncache_all();
        assert!(cache.is_destroyed());
        assert_eq!(h.engine.cache_count(), 0);

        assert!(h.engine.set_volume(id, 0.25));
        assert!(h.engine.set_current_time(id, 1.0));
        assert!((h.engine.current_time(id) - 1.0).abs() < 1e-6);
        assert!((h.engine.duration(id) - 2.0).abs() < 1e-6);
        assert_eq!(h.engine.state(id), Some(AudioState::Playing));

        let again = h.play_ready("sfx/a.wav");
        assert!(again.is_valid());
        assert_eq!(h.decoder.open_count("sfx/a.wav"), 2);
    }

    #[test]
    fn test_uncache_while_decoding_removes_waiting_player() {
        let h = harness(2);
        h.decoder.hold();
        let id = h.engine.play("sfx/a.wav", false, 1.0);
        assert!(id.is_valid());

        h.engine.uncache("sfx/a.wav");
        h.tick();
        assert!(h.engine.state(id).is_none());
        assert_eq!(h.engine.source_usage(), (0, 2));

        h.decoder.release();
    }

    #[test]
    fn test_failed_decode_reaps_player() {
        let h = harness(2);
        let id = h.engine.play("sfx/broken.wav", false, 1.0);
        assert!(id.is_valid());
        h.engine
            .set_finish_callback(id, |_, _| panic!("failed players do not finish"));

        h.wait_for("the failed player to be reaped", || {
            h.tick();
            h.engine.state(id).is_none()
        });
        assert_eq!(h.engine.source_usage(), (0, 2));
        assert_eq!(
            h.engine.cache("sfx/broken.wav").map(|cache| cache.state()),
            Some(crate::audio_cache::CacheState::Failed)
        );
    }

    #[test]
    fn test_large_files_stream() {
        let h = harness_with(EngineConfig {
            max_buffered_bytes: 1024,
            ..EngineConfig::default()
        });
        let id = h.play_ready("music/theme.ogg");
        let source = h.source_of(id).expect("registered");
        let voice = h.backend.voice(source).expect("voice");
        assert!(voice.streamed);
        assert_eq!(voice.duration, Some(60.0));
        assert!(h.engine.set_current_time(id, 45.0));
    }

    #[test]
    fn test_seek_past_short_decode_is_refused() {
        let h = harness(2);
        h.decoder.insert(
            "sfx/truncated.wav",
            PcmBuffer {
                format: PcmFormat::new(100, 1, Some(400)),
                samples: vec![0.0; 100],
            },
        );
        let id = h.play_ready("sfx/truncated.wav");

        assert!(h.engine.set_current_time(id, 0.5));
        assert!(!h.engine.set_current_time(id, 2.0));
        assert!((h.engine.current_time(id) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_looping_player_survives_until_loop_cleared() {
        let h = harness(2);
        assert!(h.preload("sfx/c.wav"));
        let id = h.engine.play("sfx/c.wav", true, 3.0);
        let source = h.source_of(id).expect("registered");
        assert!((h.backend.voice(source).expect("voice").volume - 1.0).abs() < f32::EPSILON);

        h.backend.advance(5.5);
        h.tick();
        assert_eq!(h.engine.state(id), Some(AudioState::Playing));

        assert!(h.engine.set_loop(id, false));
        h.backend.advance(1.0);
        h.tick();
        assert!(h.engine.state(id).is_none());
    }

    #[test]
    fn test_pause_and_resume() {
        let h = harness(2);
        let a = h.play_ready("sfx/a.wav");
        let b = h.play_ready("sfx/b.wav");

        h.engine.pause_all();
        assert_eq!(h.engine.state(a), Some(AudioState::Paused));
        assert_eq!(h.engine.state(b), Some(AudioState::Paused));

        h.backend.advance(10.0);
        h.tick();
        assert_eq!(h.engine.playing_count(), 2);

        assert!(h.engine.resume(a));
        assert_eq!(h.engine.state(a), Some(AudioState::Playing));
        h.engine.resume_all();
        assert_eq!(h.engine.state(b), Some(AudioState::Playing));
    }

    #[test]
    fn test_driver_failure_is_reported_not_fatal() {
        let h = harness(2);
        let id = h.play_ready("sfx/a.wav");

        h.backend.set_fault(Some(0xA004));
        assert!(!h.engine.pause(id));
        assert!(!h.engine.set_volume(id, 0.5));
        assert_eq!(h.engine.current_time(id), 0.0);

        h.backend.set_fault(None);
        assert!(h.engine.pause(id));
    }

    #[test]
    fn test_asset_root_resolution() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("assets/sfx/a.wav", clip(1.0));
        let engine = AudioEngine::with_decoder(
            EngineConfig {
                asset_root: Some(PathBuf::from("assets")),
                ..EngineConfig::default()
            },
            Arc::new(Scheduler::new()),
            Arc::clone(&decoder) as Arc<dyn AudioDecoder>,
        );
        let backend: Arc<dyn VoiceBackend> = Arc::new(SimulatedBackend::new());
        assert!(engine.init_with(move || Ok(backend)));

        let cache = engine.preload("sfx/a.wav", |_| {}).expect("cache");
        assert_eq!(cache.file_path(), "sfx/a.wav");
        assert_eq!(cache.full_path(), Path::new("assets").join("sfx/a.wav"));
    }

    #[test]
    fn test_empty_path_and_shutdown() {
        let h = harness(2);
        assert_eq!(h.engine.play("", false, 1.0), AudioId::INVALID);
        assert!(h.engine.preload("", |ok| assert!(!ok)).is_none());

        let id = h.play_ready("sfx/a.wav");
        assert!(id.is_valid());
        h.engine.shutdown();

        assert!(h.backend.is_shut_down());
        assert!(h.scheduler.is_empty());
        assert_eq!(h.engine.playing_count(), 0);
        assert_eq!(h.engine.cache_count(), 0);
        assert_eq!(h.engine.play("sfx/a.wav", false, 1.0), AudioId::INVALID);

        let backend: Arc<dyn VoiceBackend> = Arc::new(SimulatedBackend::new());
        assert!(!h.engine.init_with(move || Ok(backend)));
    }

    #[test]
    fn test_concurrent_control_during_reaping() {
        let h = harness(8);
        for path in ["sfx/a.wav", "sfx/b.wav", "sfx/c.wav"] {
            assert!(h.preload(path));
        }
        let engine = Arc::new(h.engine);

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let id = engine.play("sfx/c.wav", round % 2 == 0, 0.5);
                        engine.set_volume(id, 0.8);
                        engine.pause(id);
                        engine.resume(id);
                        if (round + worker) % 3 == 0 {
                            engine.stop(id);
                        }
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            h.backend.advance(0.3);
            h.scheduler.tick(TICK);
        }
        for worker in workers {
            worker.join().expect("worker panicked");
        }

        let (in_use, capacity) = engine.source_usage();
        assert_eq!(in_use, engine.playing_count());
        assert!(in_use <= capacity);

        engine.stop_all();
        assert_eq!(engine.source_usage(), (0, 8));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Play(usize),
        Stop(usize),
        Finish(usize),
        Tick,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize).prop_map(Op::Play),
            any::<usize>().prop_map(Op::Stop),
            any::<usize>().prop_map(Op::Finish),
            Just(Op::Tick),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_voices_stay_exclusive(ops in proptest::collection::vec(op(), 1..60)) {
            const VOICES: usize = 3;
            const PATHS: [&str; 3] = ["sfx/a.wav", "sfx/b.wav", "sfx/c.wav"];

            let h = harness(VOICES);
            for path in PATHS {
                prop_assert!(h.preload(path));
            }
            let finished = Arc::new(AtomicUsize::new(0));
            let mut issued: Vec<AudioId> = Vec::new();

            for op in ops {
                match op {
                    Op::Play(clip) => {
                        let id = h.engine.play(PATHS[clip], false, 1.0);
                        if id.is_valid() {
                            let finished = Arc::clone(&finished);
                            h.engine.set_finish_callback(id, move |_, _| {
                                finished.fetch_add(1, Ordering::SeqCst);
                            });
                            issued.push(id);
                        } else {
                            prop_assert_eq!(h.engine.source_usage().0, VOICES);
                        }
                    },
                    Op::Stop(pick) if !issued.is_empty() => {
                        h.engine.stop(issued[pick % issued.len()]);
                    },
                    Op::Finish(pick) if !issued.is_empty() => {
                        if let Some(source) = h.source_of(issued[pick % issued.len()]) {
                            h.backend.finish(source);
                        }
                    },
                    Op::Tick => h.tick(),
                    _ => {},
                }

                let state = h.engine.inner.state.lock();
                prop_assert!(state.pool.in_use() <= VOICES);
                prop_assert_eq!(state.pool.in_use(), state.players.len());

                let live: HashSet<SourceId> =
                    state.players.values().map(|player| player.source()).collect();
                prop_assert_eq!(live.len(), state.players.len());
                for source in &live {
                    prop_assert!(!state.pool.is_free(*source));
                }
            }

            prop_assert!(finished.load(Ordering::SeqCst) <= issued.len());
        }
    }
}
