//! Background worker threads for decode jobs.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

/// A unit of work run on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads fed from one queue.
pub struct TaskPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.name)
            .field("workers", &self.workers.lock().len())
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}

impl TaskPool {
    /// Spawn `workers` threads named `{name}-{i}`.
    ///
    /// Threads that fail to spawn are logged and skipped; the pool keeps at
    /// least accepting jobs as long as one worker started.
    #[must_use]
    pub fn new(workers: usize, name: &str) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let handles: Vec<JoinHandle<()>> = (0..workers.max(1))
            .filter_map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(receiver))
                    .map_err(|e| error!("Failed to spawn {name}-{i}: {e}"))
                    .ok()
            })
            .collect();

        debug!("Task pool '{}' started {} workers", name, handles.len());

        Self {
            name: name.to_string(),
            sender: Mutex::new((!handles.is_empty()).then_some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Queue a job. Returns `false` if the pool was shut down.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => {
                warn!("Task pool '{}' is shut down; dropping job", self.name);
                false
            },
        }
    }

    /// Stop accepting jobs, let queued jobs finish and join the workers.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Task pool '{}' worker panicked", self.name);
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Background job panicked");
        }
    }
}
