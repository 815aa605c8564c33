//! Per-frame callback driver.
//!
//! The host calls [`Scheduler::tick`] once per frame on its main thread. Each
//! registered callback accumulates frame time and fires once its interval has
//! elapsed, receiving the accumulated time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

/// Callback invoked with the time accumulated since it last fired.
pub type ScheduleCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Handle identifying a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleKey(u64);

struct Entry {
    interval: f32,
    elapsed: f32,
    callback: ScheduleCallback,
}

#[derive(Default)]
struct SchedulerState {
    entries: BTreeMap<ScheduleKey, Entry>,
    next_key: u64,
}

/// Cooperative scheduler ticked by the host.
#[derive(Default)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.len())
            .finish()
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` to run every `interval`.
    pub fn schedule(&self, interval: Duration, callback: ScheduleCallback) -> ScheduleKey {
        let mut state = self.state.lock();
        state.next_key += 1;
        let key = ScheduleKey(state.next_key);
        state.entries.insert(
            key,
            Entry {
                interval: interval.as_secs_f32(),
                elapsed: 0.0,
                callback,
            },
        );
        key
    }

    /// Remove a callback. Returns `false` if it was not scheduled.
    pub fn unschedule(&self, key: ScheduleKey) -> bool {
        self.state.lock().entries.remove(&key).is_some()
    }

    /// Check if `key` is still scheduled.
    #[must_use]
    pub fn is_scheduled(&self, key: ScheduleKey) -> bool {
        self.state.lock().entries.contains_key(&key)
    }

    /// Number of scheduled callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance every entry by `dt` seconds and run the ones that are due.
    pub fn tick(&self, dt: f32) {
        let due: Vec<(ScheduleKey, ScheduleCallback, f32)> = {
            let mut state = self.state.lock();
            state
                .entries
                .iter_mut()
                .filter_map(|(key, entry)| {
                    entry.elapsed += dt;
                    if entry.elapsed < entry.interval {
                        return None;
                    }
                    let elapsed = std::mem::take(&mut entry.elapsed);
                    Some((*key, Arc::clone(&entry.callback), elapsed))
                })
                .collect()
        };

        for (key, callback, elapsed) in due {
            // An earlier callback in this tick may have removed this one.
            if self.is_scheduled(key) {
                trace!("Scheduler firing {:?} after {elapsed:.3}s", key);
                callback(elapsed);
            }
        }
    }
}
