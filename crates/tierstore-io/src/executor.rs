//! Background task runners.
//!
//! `SerialExecutor` runs tasks one at a time on a dedicated thread, in
//! submission order. `InlineExecutor` runs them on the caller's thread (tests,
//! single-threaded tools).

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use tierstore_core::error::Result;
use tierstore_core::runner::{Task, TaskRunner};

pub struct SerialExecutor {
    tx: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl SerialExecutor {
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in rx {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        warn!("background task panicked");
                    }
                    worker_pending.fetch_sub(1, Ordering::AcqRel);
                }
                debug!("serial executor stopped");
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            pending,
        })
    }

    /// Tasks submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Block until every task submitted before this call has run.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        self.execute(Box::new(move || {
            let _ = done_tx.send(());
        }));
        let _ = done_rx.recv();
    }

    /// Stop accepting tasks, drain the queue and join the worker.
    ///
    /// Called from a task on the worker itself (the last owner dropped inside
    /// a task), the worker is left to finish the queue and exit on its own.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            debug!("serial executor shut down from its own worker; not joining");
            return;
        }
        if worker.join().is_err() {
            warn!("serial executor worker panicked");
        }
    }
}

impl TaskRunner for SerialExecutor {
    fn execute(&self, task: Task) {
        let rejected = {
            let guard = self.tx.lock();
            match guard.as_ref() {
                Some(tx) => {
                    self.pending.fetch_add(1, Ordering::AcqRel);
                    match tx.send(task) {
                        Ok(()) => None,
                        Err(mpsc::SendError(task)) => {
                            self.pending.fetch_sub(1, Ordering::AcqRel);
                            Some(task)
                        }
                    }
                }
                None => Some(task),
            }
        };
        // Shut down: run inline rather than drop the work.
        if let Some(task) = rejected {
            task();
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs every task immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskRunner for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}
