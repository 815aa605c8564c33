//! Voice sample source.
//!
//! [`VoiceSource`] is the `rodio::Source` appended to a voice's sink. It plays
//! a [`VoiceFeed`] and exposes a small set of lock-free controls so the
//! backend can change looping, read the playback position and request seeks
//! while the mixer thread owns the source.
//!
//! Streamed feeds are decoded on a `cadence-stream-N` thread that runs a few
//! chunks ahead of the mixer. The mixer only ever polls that thread's queue;
//! when the queue is empty it plays a frame of silence.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use rodio::Source;
use tracing::{debug, warn};

use crate::audio_decode::{PcmStream, DECODE_CHUNK_FRAMES};
use crate::audio_resource::{PcmBuffer, PcmFormat, StreamOpener, VoiceFeed};

/// Decoded chunks a stream thread may queue ahead of the mixer.
const STREAM_QUEUE_CHUNKS: usize = 4;

static STREAM_THREADS: AtomicUsize = AtomicUsize::new(0);

const NO_SEEK: u64 = u64::MAX;

/// Controls shared between a backend and the source it handed to the mixer.
#[derive(Debug)]
pub struct VoiceControls {
    sample_rate: u32,
    looping: AtomicBool,
    frames_played: AtomicU64,
    seek_request: AtomicU64,
}

impl VoiceControls {
    /// Create controls for a voice running at `sample_rate`.
    #[must_use]
    pub fn new(sample_rate: u32, looping: bool) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            looping: AtomicBool::new(looping),
            frames_played: AtomicU64::new(0),
            seek_request: AtomicU64::new(NO_SEEK),
        })
    }

    /// Sample rate of the voice.
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Enable or disable looping; takes effect at the end of the current pass.
    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }

    /// Check if the voice loops.
    #[must_use]
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Frames played since the start of the current pass.
    #[must_use]
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Acquire)
    }

    /// Playback position in seconds.
    #[must_use]
    pub fn position_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.frames_played() as f64 / f64::from(self.sample_rate)) as f32
    }

    /// Ask the source to jump to `frame` before producing its next frame.
    pub fn request_seek(&self, frame: u64) {
        self.seek_request.store(frame.min(NO_SEEK - 1), Ordering::Release);
        // Report the target immediately so a position query right after a
        // seek does not see the old offset.
        self.frames_played.store(frame, Ordering::Release);
    }

    fn take_seek(&self) -> Option<u64> {
        match self.seek_request.swap(NO_SEEK, Ordering::AcqRel) {
            NO_SEEK => None,
            frame => Some(frame),
        }
    }
}

/// Restart a stream at `frame`; chunks from older generations are dropped.
struct SeekRequest {
    generation: u64,
    frame: u64,
}

enum StreamChunk {
    Samples { generation: u64, samples: Vec<f32> },
    End { generation: u64 },
}

enum ProducerStep {
    Continue,
    Restart(SeekRequest),
    Stop,
}

/// Decodes one streamed feed off the mixer thread.
struct StreamProducer {
    open: StreamOpener,
    requests: Receiver<SeekRequest>,
    chunks: Sender<StreamChunk>,
}

impl StreamProducer {
    /// Start a producer thread for `open`.
    ///
    /// If the thread cannot be spawned the returned queue is already closed
    /// and the voice ends on its first pull.
    fn spawn(open: StreamOpener) -> (Sender<SeekRequest>, Receiver<StreamChunk>) {
        let (request_tx, request_rx) = unbounded();
        let (chunk_tx, chunk_rx) = bounded(STREAM_QUEUE_CHUNKS);
        let producer = Self {
            open,
            requests: request_rx,
            chunks: chunk_tx,
        };

        let index = STREAM_THREADS.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = thread::Builder::new()
            .name(format!("cadence-stream-{index}"))
            .spawn(move || producer.run())
        {
            warn!("Failed to spawn stream thread: {e}");
        }
        (request_tx, chunk_rx)
    }

    fn run(self) {
        let mut generation = 0;
        let mut stream = self.open_at(0);
        loop {
            let chunk = Self::read_chunk(generation, &mut stream);
            let ended = matches!(chunk, StreamChunk::End { .. });
            let step = select! {
                send(self.chunks, chunk) -> sent => match sent {
                    Err(_) => ProducerStep::Stop,
                    // Nothing left to decode until the voice seeks or loops.
                    Ok(()) if ended => self.requests.recv().map_or(ProducerStep::Stop, ProducerStep::Restart),
                    Ok(()) => ProducerStep::Continue,
                },
                recv(self.requests) -> request => request.map_or(ProducerStep::Stop, ProducerStep::Restart),
            };
            match step {
                ProducerStep::Continue => {},
                ProducerStep::Restart(request) => (generation, stream) = self.restart(request),
                ProducerStep::Stop => break,
            }
        }
        debug!("Stream thread {:?} exiting", thread::current().name());
    }

    fn restart(&self, request: SeekRequest) -> (u64, Option<Box<dyn PcmStream>>) {
        // Only the newest pending request matters.
        let latest = self.requests.try_iter().last().unwrap_or(request);
        (latest.generation, self.open_at(latest.frame))
    }

    fn open_at(&self, frame: u64) -> Option<Box<dyn PcmStream>> {
        let mut stream = match (self.open)() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open voice stream: {e}");
                return None;
            },
        };
        if frame > 0 {
            if let Err(e) = stream.skip_frames(frame) {
                warn!("Voice stream seek failed: {e}");
            }
        }
        Some(stream)
    }

    fn read_chunk(generation: u64, stream: &mut Option<Box<dyn PcmStream>>) -> StreamChunk {
        let Some(reader) = stream.as_mut() else {
            return StreamChunk::End { generation };
        };
        let mut samples = Vec::with_capacity(DECODE_CHUNK_FRAMES * reader.format().channels as usize);
        match reader.read_frames(DECODE_CHUNK_FRAMES, &mut samples) {
            Ok(0) => {},
            Ok(_) => return StreamChunk::Samples { generation, samples },
            Err(e) => warn!("Voice stream read failed: {e}"),
        }
        *stream = None;
        StreamChunk::End { generation }
    }
}

enum Cursor {
    Buffered {
        buffer: Arc<PcmBuffer>,
        pos: usize,
    },
    Streamed {
        requests: Sender<SeekRequest>,
        chunks: Receiver<StreamChunk>,
        generation: u64,
        chunk: Vec<f32>,
        pos: usize,
    },
}

enum Pull {
    Sample(f32),
    Starved,
    End,
}

/// A playable voice feed with looping, position tracking and seeking.
pub struct VoiceSource {
    cursor: Cursor,
    format: PcmFormat,
    controls: Arc<VoiceControls>,
    channel: u16,
    silence: u16,
    rewound: bool,
    finished: bool,
}

impl VoiceSource {
    /// Create a source over `feed`, controlled through `controls`.
    ///
    /// Streamed feeds start decoding on their own thread right away.
    #[must_use]
    pub fn new(feed: VoiceFeed, controls: Arc<VoiceControls>) -> Self {
        let format = feed.format();
        let cursor = match feed {
            VoiceFeed::Buffered(buffer) => Cursor::Buffered { buffer, pos: 0 },
            VoiceFeed::Streamed { open, .. } => {
                let (requests, chunks) = StreamProducer::spawn(open);
                Cursor::Streamed {
                    requests,
                    chunks,
                    generation: 0,
                    chunk: Vec::new(),
                    pos: 0,
                }
            },
        };
        Self {
            cursor,
            format,
            controls,
            channel: 0,
            silence: 0,
            rewound: false,
            finished: false,
        }
    }

    fn pull(&mut self) -> Pull {
        match &mut self.cursor {
            Cursor::Buffered { buffer, pos } => {
                let sample = buffer.samples.get(*pos).copied();
                *pos += 1;
                sample.map_or(Pull::End, Pull::Sample)
            },
            Cursor::Streamed {
                chunks,
                generation,
                chunk,
                pos,
                ..
            } => loop {
                if let Some(&sample) = chunk.get(*pos) {
                    *pos += 1;
                    return Pull::Sample(sample);
                }
                match chunks.try_recv() {
                    Ok(StreamChunk::Samples { generation: g, samples }) if g == *generation => {
                        *chunk = samples;
                        *pos = 0;
                    },
                    Ok(StreamChunk::End { generation: g }) if g == *generation => return Pull::End,
                    Ok(_) => {},
                    Err(TryRecvError::Empty) => return Pull::Starved,
                    Err(TryRecvError::Disconnected) => return Pull::End,
                }
            },
        }
    }

    fn seek(&mut self, frame: u64) {
        let channels = self.format.channels as usize;
        match &mut self.cursor {
            Cursor::Buffered { buffer, pos } => {
                let frame = (frame as usize).min(buffer.frames());
                *pos = frame * channels;
            },
            Cursor::Streamed {
                requests,
                generation,
                chunk,
                pos,
                ..
            } => {
                *generation += 1;
                chunk.clear();
                *pos = 0;
                // A closed producer shows up as the end of the stream.
                let _ = requests.send(SeekRequest {
                    generation: *generation,
                    frame,
                });
            },
        }
        self.controls.frames_played.store(frame, Ordering::Release);
    }
}

impl Iterator for VoiceSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.finished {
            return None;
        }
        if self.silence > 0 {
            self.silence -= 1;
            return Some(0.0);
        }

        if self.channel == 0 {
            if let Some(frame) = self.controls.take_seek() {
                self.seek(frame);
            }
        }

        loop {
            match self.pull() {
                Pull::Sample(sample) => {
                    self.rewound = false;
                    self.channel += 1;
                    if self.channel >= self.format.channels {
                        self.channel = 0;
                        self.controls.frames_played.fetch_add(1, Ordering::AcqRel);
                    }
                    return Some(sample);
                },
                Pull::Starved => {
                    // Chunks hold whole frames, so an underrun starts on a
                    // frame boundary. Fill one frame without moving the position.
                    self.silence = self.format.channels.saturating_sub(1);
                    return Some(0.0);
                },
                Pull::End => {
                    // An empty pass after a rewind means there is nothing to loop over.
                    if self.rewound || self.channel != 0 || !self.controls.is_looping() {
                        self.finished = true;
                        return None;
                    }
                    self.seek(0);
                    self.rewound = true;
                },
            }
        }
    }
}

impl Source for VoiceSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.format.channels
    }

    fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        if self.controls.is_looping() {
            return None;
        }
        self.format
            .duration_secs()
            .map(|secs| Duration::from_secs_f32(secs.max(0.0)))
    }
}
