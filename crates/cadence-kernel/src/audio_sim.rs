//! Simulated audio device and in-memory decoder.
//!
//! Used by headless hosts (servers, CI) and by tests. Voices do not produce
//! sound; they advance when the host calls [`SimulatedBackend::advance`], so
//! playback timing is fully deterministic.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::audio_backend::{VoiceBackend, VoiceParams, VoiceState};
use crate::audio_decode::{AudioDecoder, PcmStream};
use crate::audio_resource::{PcmBuffer, PcmFormat, VoiceFeed};
use cadence_common::{AudioError, AudioResult, SourceId};

/// Observable state of one simulated voice.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSnapshot {
    /// Current play state.
    pub state: VoiceState,
    /// Volume last applied.
    pub volume: f32,
    /// Whether the voice loops.
    pub looping: bool,
    /// Playback position in seconds.
    pub offset: f32,
    /// Length of the feed in seconds, if known.
    pub duration: Option<f32>,
    /// Whether the feed is streamed.
    pub streamed: bool,
}

impl VoiceSnapshot {
    fn idle() -> Self {
        Self {
            state: VoiceState::Initial,
            volume: 1.0,
            looping: false,
            offset: 0.0,
            duration: None,
            streamed: false,
        }
    }
}

/// Voice backend without an output device.
#[derive(Debug)]
pub struct SimulatedBackend {
    voices: Mutex<Vec<VoiceSnapshot>>,
    voice_limit: usize,
    fault: AtomicU32,
    plays: AtomicUsize,
    shut_down: AtomicBool,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// Create a backend that can allocate any number of voices.
    #[must_use]
    pub fn new() -> Self {
        Self::with_voice_limit(usize::MAX)
    }

    /// Create a backend whose device supports at most `limit` voices.
    #[must_use]
    pub fn with_voice_limit(limit: usize) -> Self {
        Self {
            voices: Mutex::new(Vec::new()),
            voice_limit: limit,
            fault: AtomicU32::new(0),
            plays: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Make every control call fail with `code`, or clear the fault with `None`.
    pub fn set_fault(&self, code: Option<u32>) {
        self.fault.store(code.unwrap_or(0), Ordering::Release);
    }

    /// Advance every playing voice by `dt` seconds.
    pub fn advance(&self, dt: f32) {
        let mut voices = self.voices.lock();
        for voice in voices.iter_mut() {
            if voice.state != VoiceState::Playing {
                continue;
            }
            voice.offset += dt;
            if let Some(duration) = voice.duration {
                if voice.offset >= duration {
                    if voice.looping && duration > 0.0 {
                        voice.offset %= duration;
                    } else {
                        voice.state = VoiceState::Stopped;
                        voice.offset = 0.0;
                    }
                }
            }
        }
    }

    /// End a voice as if its audio ran out.
    pub fn finish(&self, voice: SourceId) {
        if let Some(state) = self.voices.lock().get_mut(voice.index()) {
            state.state = VoiceState::Stopped;
            state.offset = 0.0;
        }
    }

    /// Snapshot of one voice.
    #[must_use]
    pub fn voice(&self, voice: SourceId) -> Option<VoiceSnapshot> {
        self.voices.lock().get(voice.index()).cloned()
    }

    /// Number of `play` calls that reached the device.
    #[must_use]
    pub fn play_count(&self) -> usize {
        self.plays.load(Ordering::Acquire)
    }

    /// Check if `shutdown` was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn check_fault(&self, op: &'static str) -> AudioResult<()> {
        match self.fault.load(Ordering::Acquire) {
            0 => Ok(()),
            code => Err(AudioError::Driver { op, code }),
        }
    }

    fn with_voice<R>(
        &self,
        op: &'static str,
        voice: SourceId,
        f: impl FnOnce(&mut VoiceSnapshot) -> R,
    ) -> AudioResult<R> {
        self.check_fault(op)?;
        let mut voices = self.voices.lock();
        let state = voices
            .get_mut(voice.index())
            .ok_or(AudioError::UnknownVoice(voice))?;
        Ok(f(state))
    }
}

impl VoiceBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn allocate_voices(&self, count: usize) -> AudioResult<Vec<SourceId>> {
        let mut voices = self.voices.lock();
        let available = self.voice_limit.saturating_sub(voices.len());
        if count > available {
            return Err(AudioError::VoiceAllocationFailed {
                requested: count,
                available,
            });
        }
        let first = voices.len();
        voices.extend((0..count).map(|_| VoiceSnapshot::idle()));
        debug!("Simulated backend allocated {} voices", count);
        Ok((first..first + count).map(|i| SourceId::new(i as u32)).collect())
    }

    fn play(&self, voice: SourceId, feed: VoiceFeed, params: VoiceParams) -> AudioResult<()> {
        self.with_voice("play", voice, |state| {
            *state = VoiceSnapshot {
                state: VoiceState::Playing,
                volume: params.volume,
                looping: params.looping,
                offset: 0.0,
                duration: feed.duration_secs(),
                streamed: feed.is_streamed(),
            };
        })?;
        self.plays.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn pause(&self, voice: SourceId) -> AudioResult<()> {
        self.with_voice("pause", voice, |state| {
            if state.state == VoiceState::Playing {
                state.state = VoiceState::Paused;
            }
        })
    }

    fn resume(&self, voice: SourceId) -> AudioResult<()> {
        self.with_voice("resume", voice, |state| {
            if state.state == VoiceState::Paused {
                state.state = VoiceState::Playing;
            }
        })
    }

    fn stop(&self, voice: SourceId) -> AudioResult<()> {
        self.with_voice("stop", voice, |state| {
            state.state = VoiceState::Stopped;
            state.offset = 0.0;
        })
    }

    fn set_volume(&self, voice: SourceId, volume: f32) -> AudioResult<()> {
        self.with_voice("set_volume", voice, |state| state.volume = volume)
    }

    fn set_looping(&self, voice: SourceId, looping: bool) -> AudioResult<()> {
        self.with_voice("set_looping", voice, |state| state.looping = looping)
    }

    fn offset(&self, voice: SourceId) -> AudioResult<f32> {
        self.with_voice("offset", voice, |state| state.offset)
    }

    fn set_offset(&self, voice: SourceId, seconds: f32) -> AudioResult<()> {
        self.with_voice("set_offset", voice, |state| {
            let upper = state.duration.unwrap_or(f32::MAX);
            state.offset = seconds.clamp(0.0, upper);
        })
    }

    fn voice_state(&self, voice: SourceId) -> AudioResult<VoiceState> {
        self.voices
            .lock()
            .get(voice.index())
            .map(|v| v.state)
            .ok_or(AudioError::UnknownVoice(voice))
    }

    fn shutdown(&self) {
        for voice in self.voices.lock().iter_mut() {
            voice.state = VoiceState::Stopped;
        }
        self.shut_down.store(true, Ordering::Release);
    }
}

enum MemoryEntry {
    Clip(Arc<PcmBuffer>),
    Broken(String),
}

/// Decoder serving clips registered in memory.
///
/// Counts how often each path is opened and can hold opens back to simulate
/// slow decodes.
#[derive(Default)]
pub struct MemoryDecoder {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    opens: Mutex<HashMap<String, usize>>,
    held: Mutex<bool>,
    released: Condvar,
}

impl std::fmt::Debug for MemoryDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDecoder")
            .field("clips", &self.entries.lock().len())
            .field("held", &*self.held.lock())
            .finish_non_exhaustive()
    }
}

impl MemoryDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a clip under `path`.
    pub fn insert(&self, path: impl Into<String>, clip: PcmBuffer) {
        self.entries
            .lock()
            .insert(path.into(), MemoryEntry::Clip(Arc::new(clip)));
    }

    /// Register a path whose decode fails with `message`.
    pub fn insert_broken(&self, path: impl Into<String>, message: impl Into<String>) {
        self.entries
            .lock()
            .insert(path.into(), MemoryEntry::Broken(message.into()));
    }

    /// Block every `open` until [`release`](Self::release) is called.
    pub fn hold(&self) {
        *self.held.lock() = true;
    }

    /// Let held and future opens proceed.
    pub fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    /// How many times `path` was opened.
    #[must_use]
    pub fn open_count(&self, path: &str) -> usize {
        self.opens.lock().get(path).copied().unwrap_or(0)
    }

    /// Total number of opens across all paths.
    #[must_use]
    pub fn total_opens(&self) -> usize {
        self.opens.lock().values().sum()
    }
}

impl AudioDecoder for MemoryDecoder {
    fn open(&self, path: &Path) -> AudioResult<Box<dyn PcmStream>> {
        let key = path.to_string_lossy().replace('\\', "/");
        *self.opens.lock().entry(key.clone()).or_insert(0) += 1;

        {
            let mut held = self.held.lock();
            while *held {
                self.released.wait(&mut held);
            }
        }

        match self.entries.lock().get(&key) {
            Some(MemoryEntry::Clip(clip)) => Ok(Box::new(MemoryStream {
                clip: Arc::clone(clip),
                frame: 0,
            })),
            Some(MemoryEntry::Broken(message)) => Err(AudioError::DecodeFailed(message.clone())),
            None => Err(AudioError::LoadFailed {
                path: path.to_path_buf(),
                message: "no such clip".to_string(),
            }),
        }
    }
}

struct MemoryStream {
    clip: Arc<PcmBuffer>,
    frame: usize,
}

impl PcmStream for MemoryStream {
    fn format(&self) -> PcmFormat {
        self.clip.format
    }

    fn read_frames(&mut self, max_frames: usize, out: &mut Vec<f32>) -> AudioResult<usize> {
        let channels = self.clip.format.channels as usize;
        let frames = max_frames.min(self.clip.frames() - self.frame);
        let start = self.frame * channels;
        out.extend_from_slice(&self.clip.samples[start..start + frames * channels]);
        self.frame += frames;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(seconds: u32) -> Arc<PcmBuffer> {
        Arc::new(PcmBuffer::new(10, 1, vec![0.0; 10 * seconds as usize]))
    }

    #[test]
    fn test_voice_plays_to_completion() {
        let backend = SimulatedBackend::new();
        let voices = backend.allocate_voices(2).expect("allocate");
        let voice = voices[0];

        backend
            .play(voice, VoiceFeed::Buffered(clip(2)), VoiceParams::default())
            .expect("play");
        backend.advance(1.0);
        assert_eq!(backend.voice_state(voice).expect("state"), VoiceState::Playing);
        assert!((backend.offset(voice).expect("offset") - 1.0).abs() < 1e-6);

        backend.advance(1.5);
        assert_eq!(backend.voice_state(voice).expect("state"), VoiceState::Stopped);
        assert_eq!(backend.play_count(), 1);
    }

    #[test]
    fn test_looping_voice_wraps() {
        let backend = SimulatedBackend::new();
        let voice = backend.allocate_voices(1).expect("allocate")[0];
        let params = VoiceParams {
            volume: 0.5,
            looping: true,
        };
        backend
            .play(voice, VoiceFeed::Buffered(clip(2)), params)
            .expect("play");
        backend.advance(5.0);

        let snapshot = backend.voice(voice).expect("voice");
        assert_eq!(snapshot.state, VoiceState::Playing);
        assert!((snapshot.offset - 1.0).abs() < 1e-6);
        assert!((snapshot.volume - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_paused_voice_does_not_advance() {
        let backend = SimulatedBackend::new();
        let voice = backend.allocate_voices(1).expect("allocate")[0];
        backend
            .play(voice, VoiceFeed::Buffered(clip(2)), VoiceParams::default())
            .expect("play");
        backend.pause(voice).expect("pause");
        backend.advance(10.0);
        assert_eq!(backend.voice_state(voice).expect("state"), VoiceState::Paused);

        backend.resume(voice).expect("resume");
        backend.advance(10.0);
        assert_eq!(backend.voice_state(voice).expect("state"), VoiceState::Stopped);
    }

    #[test]
    fn test_voice_limit() {
        let backend = SimulatedBackend::with_voice_limit(4);
        let err = backend.allocate_voices(5).err().expect("over the limit");
        assert!(matches!(
            err,
            AudioError::VoiceAllocationFailed {
                requested: 5,
                available: 4
            }
        ));
        assert_eq!(backend.allocate_voices(4).expect("allocate").len(), 4);
    }

    #[test]
    fn test_fault_injection() {
        let backend = SimulatedBackend::new();
        let voice = backend.allocate_voices(1).expect("allocate")[0];
        backend.set_fault(Some(0xA003));
        assert!(matches!(
            backend.pause(voice),
            Err(AudioError::Driver {
                op: "pause",
                code: 0xA003
            })
        ));
        backend.set_fault(None);
        assert!(backend.pause(voice).is_ok());
        assert!(matches!(
            backend.pause(SourceId::new(9)),
            Err(AudioError::UnknownVoice(_))
        ));
    }

    #[test]
    fn test_memory_decoder_counts_and_fails() {
        let decoder = MemoryDecoder::new();
        decoder.insert("a.wav", PcmBuffer::new(10, 1, vec![0.0; 3]));
        decoder.insert_broken("b.wav", "truncated header");

        assert!(decoder.open(Path::new("a.wav")).is_ok());
        assert!(matches!(
            decoder.open(Path::new("b.wav")).err(),
            Some(AudioError::DecodeFailed(_))
        ));
        assert!(matches!(
            decoder.open(Path::new("c.wav")).err(),
            Some(AudioError::LoadFailed { .. })
        ));
        assert_eq!(decoder.open_count("a.wav"), 1);
        assert_eq!(decoder.total_opens(), 3);
    }

    #[test]
    fn test_memory_decoder_hold_blocks_open() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.insert("slow.wav", PcmBuffer::new(10, 1, vec![0.0; 3]));
        decoder.hold();

        let worker_decoder = Arc::clone(&decoder);
        let worker = std::thread::spawn(move || worker_decoder.open(Path::new("slow.wav")).is_ok());

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!worker.is_finished());

        decoder.release();
        assert!(worker.join().expect("worker"));
    }
}
