//! Audio decoding.
//!
//! Decoders turn a file path into a [`PcmStream`] that yields interleaved
//! `f32` frames. The engine's caches read from these streams on worker
//! threads, so both traits are `Send`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rodio::{Decoder, Source};
use tracing::debug;

use crate::audio_resource::{PcmBuffer, PcmFormat};
use cadence_common::{AudioError, AudioResult};

/// Frames pulled per read when draining a whole stream.
pub const DECODE_CHUNK_FRAMES: usize = 4096;

/// A forward-only source of decoded frames.
pub trait PcmStream: Send {
    /// Layout of the decoded samples.
    fn format(&self) -> PcmFormat;

    /// Append up to `max_frames` frames to `out`.
    ///
    /// Returns the number of frames appended; 0 means end of stream.
    fn read_frames(&mut self, max_frames: usize, out: &mut Vec<f32>) -> AudioResult<usize>;

    /// Discard up to `frames` frames. Returns how many were skipped.
    fn skip_frames(&mut self, frames: u64) -> AudioResult<u64> {
        let mut scratch = Vec::with_capacity(DECODE_CHUNK_FRAMES * self.format().channels as usize);
        let mut skipped = 0;
        while skipped < frames {
            scratch.clear();
            let want = (frames - skipped).min(DECODE_CHUNK_FRAMES as u64) as usize;
            let read = self.read_frames(want, &mut scratch)?;
            if read == 0 {
                break;
            }
            skipped += read as u64;
        }
        Ok(skipped)
    }
}

/// Opens audio files for decoding.
pub trait AudioDecoder: Send + Sync {
    /// Open `path` and return a stream positioned at the first frame.
    fn open(&self, path: &Path) -> AudioResult<Box<dyn PcmStream>>;
}

/// Drain a stream into a single buffer.
pub fn read_to_end(stream: &mut dyn PcmStream) -> AudioResult<PcmBuffer> {
    let format = stream.format();
    let capacity = format
        .total_frames
        .map_or(0, |frames| frames as usize * format.channels as usize);
    let mut samples = Vec::with_capacity(capacity);
    while stream.read_frames(DECODE_CHUNK_FRAMES, &mut samples)? > 0 {}
    Ok(PcmBuffer::new(format.sample_rate, format.channels, samples))
}

/// Decoder for WAV/OGG/FLAC/MP3 files backed by `rodio::Decoder`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioDecoder;

impl RodioDecoder {
    /// Create a new decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AudioDecoder for RodioDecoder {
    fn open(&self, path: &Path) -> AudioResult<Box<dyn PcmStream>> {
        let file = File::open(path).map_err(|e| AudioError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let decoder = Decoder::new(BufReader::new(file)).map_err(|e| AudioError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let sample_rate = decoder.sample_rate();
        let channels = decoder.channels().max(1);
        let total_frames = decoder
            .total_duration()
            .map(|d| (d.as_secs_f64() * f64::from(sample_rate)) as u64);

        debug!(
            "Opened {:?}: {} Hz, {} ch, {:?} frames",
            path, sample_rate, channels, total_frames
        );

        Ok(Box::new(RodioPcmStream {
            format: PcmFormat::new(sample_rate, channels, total_frames),
            samples: Box::new(decoder.convert_samples::<f32>()),
        }))
    }
}

/// Stream over a rodio decoder's converted samples.
struct RodioPcmStream {
    format: PcmFormat,
    samples: Box<dyn Iterator<Item = f32> + Send>,
}

impl PcmStream for RodioPcmStream {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn read_frames(&mut self, max_frames: usize, out: &mut Vec<f32>) -> AudioResult<usize> {
        let channels = self.format.channels as usize;
        let start = out.len();
        out.extend(self.samples.by_ref().take(max_frames * channels));

        // Drop a trailing partial frame so callers only ever see whole frames.
        let read = out.len() - start;
        out.truncate(start + read - read % channels);
        Ok(read / channels)
    }
}
