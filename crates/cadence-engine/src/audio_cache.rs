//! Decoded audio shared by every player of one file.
//!
//! A cache is created the first time a path is preloaded or played and is
//! filled by a job on the decode pool. Players register a play callback and
//! start their voice once the cache settles.
//!
//! # States
//!
//! ```text
//! Uninitialized ──▶ Loading ──┬──▶ Ready
//!                             └──▶ Failed
//! ```
//!
//! Destroying a cache is orthogonal to its state: it raises a shared flag the
//! decode job polls, and drains every pending callback with
//! [`CacheOutcome::Destroyed`].
//!
//! Callbacks are never invoked while the cache's own lock is held, so they may
//! call back into the engine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use cadence_common::{AudioError, AudioResult, CacheId};
use cadence_kernel::{AudioDecoder, PcmBuffer, PcmFormat, StreamOpener, VoiceFeed, DECODE_CHUNK_FRAMES};

/// Load state of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Created, decode not yet dispatched.
    Uninitialized,
    /// Decode in progress.
    Loading,
    /// Audio available for playback.
    Ready,
    /// Decode failed; the cache will never become ready.
    Failed,
}

/// What a play callback learns about the cache it waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The cache is ready to play.
    Ready,
    /// Decoding failed.
    Failed,
    /// The cache was uncached before it settled.
    Destroyed,
}

/// Invoked once when a preload settles; `true` on success.
pub type LoadCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Invoked once when a cache a player is waiting on settles.
pub type PlayCallback = Box<dyn FnOnce(CacheOutcome) + Send + 'static>;

#[derive(Debug, Clone)]
enum CacheData {
    Empty,
    Buffered(Arc<PcmBuffer>),
    Streamed,
}

struct CacheInner {
    state: CacheState,
    format: Option<PcmFormat>,
    frames_read: u64,
    data: CacheData,
    load_callbacks: Vec<LoadCallback>,
    play_callbacks: Vec<PlayCallback>,
}

/// Decoded or streamable audio for one file.
pub struct AudioCache {
    id: CacheId,
    file_path: String,
    full_path: PathBuf,
    destroyed: Arc<AtomicBool>,
    inner: Mutex<CacheInner>,
}

impl std::fmt::Debug for AudioCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AudioCache")
            .field("id", &self.id)
            .field("file_path", &self.file_path)
            .field("state", &inner.state)
            .field("data", &inner.data)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl AudioCache {
    /// Create an empty cache for `file_path`, decoded from `full_path`.
    #[must_use]
    pub fn new(id: CacheId, file_path: impl Into<String>, full_path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            id,
            file_path: file_path.into(),
            full_path: full_path.into(),
            destroyed: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(CacheInner {
                state: CacheState::Uninitialized,
                format: None,
                frames_read: 0,
                data: CacheData::Empty,
                load_callbacks: Vec::new(),
                play_callbacks: Vec::new(),
            }),
        })
    }

    /// Cache id, for logs.
    #[must_use]
    pub fn id(&self) -> CacheId {
        self.id
    }

    /// Path the cache is keyed by.
    #[must_use]
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Resolved path the audio is decoded from.
    #[must_use]
    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    /// Current load state.
    #[must_use]
    pub fn state(&self) -> CacheState {
        self.inner.lock().state
    }

    /// Check if the cache is ready to play.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == CacheState::Ready
    }

    /// Check if the cache has been uncached.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Decoded layout, once known.
    #[must_use]
    pub fn format(&self) -> Option<PcmFormat> {
        self.inner.lock().format
    }

    /// Length in seconds, if known.
    #[must_use]
    pub fn duration(&self) -> Option<f32> {
        self.format().and_then(|format| format.duration_secs())
    }

    /// Frames decoded so far.
    #[must_use]
    pub fn frames_read(&self) -> u64 {
        self.inner.lock().frames_read
    }

    /// Check if players stream this file instead of sharing a buffer.
    #[must_use]
    pub fn is_streamed(&self) -> bool {
        matches!(self.inner.lock().data, CacheData::Streamed)
    }

    /// Check if a buffered player may seek to `seconds`.
    ///
    /// Streamed caches accept any target. Buffered caches reject targets past
    /// the decoded frames while decoding is incomplete.
    #[must_use]
    pub fn can_seek_to(&self, seconds: f32) -> bool {
        let inner = self.inner.lock();
        let Some(format) = inner.format else {
            return false;
        };
        if matches!(inner.data, CacheData::Streamed) {
            return true;
        }
        let complete = format.total_frames == Some(inner.frames_read);
        complete || format.frames_for(seconds) <= inner.frames_read
    }

    /// Build the feed a player hands to its voice. `None` unless ready.
    pub fn feed(&self, decoder: &Arc<dyn AudioDecoder>) -> Option<VoiceFeed> {
        if self.is_destroyed() {
            return None;
        }
        let inner = self.inner.lock();
        if inner.state != CacheState::Ready {
            return None;
        }
        match &inner.data {
            CacheData::Buffered(buffer) => Some(VoiceFeed::Buffered(Arc::clone(buffer))),
            CacheData::Streamed => {
                let format = inner.format?;
                let decoder = Arc::clone(decoder);
                let path = self.full_path.clone();
                let open: StreamOpener = Arc::new(move || decoder.open(&path));
                Some(VoiceFeed::Streamed { format, open })
            },
            CacheData::Empty => None,
        }
    }

    /// Mark the decode as dispatched.
    pub fn mark_loading(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CacheState::Uninitialized {
            inner.state = CacheState::Loading;
        }
    }

    /// Run `callback` once the cache settles, or now if it already has.
    pub fn add_load_callback(&self, callback: LoadCallback) {
        let success = {
            let mut inner = self.inner.lock();
            match inner.state {
                _ if self.is_destroyed() => false,
                CacheState::Ready => true,
                CacheState::Failed => false,
                CacheState::Uninitialized | CacheState::Loading => {
                    inner.load_callbacks.push(callback);
                    return;
                },
            }
        };
        callback(success);
    }

    /// Run `callback` once the cache settles, or now if it already has.
    pub fn add_play_callback(&self, callback: PlayCallback) {
        let outcome = {
            let mut inner = self.inner.lock();
            match inner.state {
                _ if self.is_destroyed() => CacheOutcome::Destroyed,
                CacheState::Ready => CacheOutcome::Ready,
                CacheState::Failed => CacheOutcome::Failed,
                CacheState::Uninitialized | CacheState::Loading => {
                    inner.play_callbacks.push(callback);
                    return;
                },
            }
        };
        callback(outcome);
    }

    /// Decode the file. Runs on a decode worker.
    ///
    /// Files whose decoded size exceeds `max_buffered_bytes`, or whose length
    /// is unknown, are left to stream.
    pub fn load(&self, decoder: &dyn AudioDecoder, max_buffered_bytes: usize) {
        if self.is_destroyed() {
            debug!("{} destroyed before decode started", self.id);
            return;
        }
        self.mark_loading();

        let result = self.decode(decoder, max_buffered_bytes);
        match result {
            Ok(Some(data)) => self.commit(Ok(data)),
            Ok(None) => debug!("{} destroyed during decode", self.id),
            Err(e) => self.commit(Err(e)),
        }
    }

    /// Settle the cache as failed without decoding.
    pub fn fail(&self, error: AudioError) {
        self.commit(Err(error));
    }

    /// Returns `Ok(None)` when the cache was destroyed mid-decode.
    fn decode(&self, decoder: &dyn AudioDecoder, max_buffered_bytes: usize) -> AudioResult<Option<CacheData>> {
        let mut stream = decoder.open(&self.full_path)?;
        let format = stream.format();
        self.inner.lock().format = Some(format);

        let buffered = format
            .total_frames
            .and_then(|frames| usize::try_from(frames).ok())
            .and_then(|frames| frames.checked_mul(format.bytes_per_frame()))
            .is_some_and(|bytes| bytes <= max_buffered_bytes);

        if !buffered {
            debug!("{} will stream {:?}", self.id, self.full_path);
            self.inner.lock().frames_read = format.total_frames.unwrap_or(0);
            return Ok(Some(CacheData::Streamed));
        }

        let capacity = format
            .total_frames
            .map_or(0, |frames| frames as usize * format.channels as usize);
        let mut samples = Vec::with_capacity(capacity);
        loop {
            if self.is_destroyed() {
                return Ok(None);
            }
            let read = stream.read_frames(DECODE_CHUNK_FRAMES, &mut samples)?;
            if read == 0 {
                break;
            }
            self.inner.lock().frames_read += read as u64;
        }

        // The container's frame count stays authoritative so a short decode
        // is visible to `can_seek_to`.
        let buffer = PcmBuffer::new(format.sample_rate, format.channels, samples);
        let frames = buffer.frames() as u64;
        if format.total_frames != Some(frames) {
            warn!(
                "{} decoded {} of {:?} frames from {:?}",
                self.id, frames, format.total_frames, self.full_path
            );
        }
        debug!("{} buffered {} bytes", self.id, buffer.size_bytes());
        self.inner.lock().frames_read = frames;
        Ok(Some(CacheData::Buffered(Arc::new(buffer))))
    }

    fn commit(&self, result: AudioResult<CacheData>) {
        let (outcome, play_callbacks, load_callbacks) = {
            let mut inner = self.inner.lock();
            if self.is_destroyed() {
                return;
            }
            let outcome = match result {
                Ok(data) => {
                    info!(
                        "{} ready: {} ({})",
                        self.id,
                        self.file_path,
                        if matches!(data, CacheData::Streamed) { "streamed" } else { "buffered" }
                    );
                    inner.data = data;
                    inner.state = CacheState::Ready;
                    CacheOutcome::Ready
                },
                Err(e) => {
                    warn!("{} failed to load {}: {e}", self.id, self.file_path);
                    inner.state = CacheState::Failed;
                    CacheOutcome::Failed
                },
            };
            (
                outcome,
                std::mem::take(&mut inner.play_callbacks),
                std::mem::take(&mut inner.load_callbacks),
            )
        };

        for callback in play_callbacks {
            callback(outcome);
        }
        let success = outcome == CacheOutcome::Ready;
        for callback in load_callbacks {
            callback(success);
        }
    }

    /// Stop any in-flight decode, drop the audio and fail pending callbacks.
    pub fn destroy(&self) {
        let (play_callbacks, load_callbacks) = {
            let mut inner = self.inner.lock();
            if self.destroyed.swap(true, Ordering::AcqRel) {
                return;
            }
            inner.data = CacheData::Empty;
            (
                std::mem::take(&mut inner.play_callbacks),
                std::mem::take(&mut inner.load_callbacks),
            )
        };

        debug!("{} destroyed ({})", self.id, self.file_path);

        for callback in play_callbacks {
            callback(CacheOutcome::Destroyed);
        }
        for callback in load_callbacks {
            callback(false);
        }
    }
}
