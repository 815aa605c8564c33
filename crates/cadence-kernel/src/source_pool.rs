//! Voice pool.
//!
//! Hands out hardware voices in FIFO order: a released voice goes to the back
//! of the queue, so the longest-idle voice is reused first.

use std::collections::{HashSet, VecDeque};

use tracing::warn;

use cadence_common::SourceId;

/// FIFO pool of voices allocated once at startup.
#[derive(Debug, Default)]
pub struct SourcePool {
    free: VecDeque<SourceId>,
    known: HashSet<SourceId>,
    idle: HashSet<SourceId>,
}

impl SourcePool {
    /// Create a pool holding `voices`, all free.
    #[must_use]
    pub fn new(voices: impl IntoIterator<Item = SourceId>) -> Self {
        let mut pool = Self::default();
        for voice in voices {
            if pool.known.insert(voice) {
                pool.idle.insert(voice);
                pool.free.push_back(voice);
            }
        }
        pool
    }

    /// Take the longest-idle voice, if any is free.
    pub fn acquire(&mut self) -> Option<SourceId> {
        let voice = self.free.pop_front()?;
        self.idle.remove(&voice);
        Some(voice)
    }

    /// Return a voice to the back of the queue.
    ///
    /// Returns `false` without changing the pool if the voice is already free
    /// or was never part of it.
    pub fn release(&mut self, voice: SourceId) -> bool {
        if !self.known.contains(&voice) {
            warn!("Released {voice} which does not belong to the pool");
            return false;
        }
        if !self.idle.insert(voice) {
            warn!("Released {voice} twice");
            return false;
        }
        self.free.push_back(voice);
        true
    }

    /// Total number of voices.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.known.len()
    }

    /// Number of free voices.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of voices currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Check if `voice` is currently free.
    #[must_use]
    pub fn is_free(&self, voice: SourceId) -> bool {
        self.idle.contains(&voice)
    }
}
