//! Lifecycle control shared by the sender, receiver, callback and ping
//! workers.
//!
//! A worker moves `Stopped -> Running -> (Receiving | Quiescing) -> Stopped`.
//! `start` and `stop` are idempotent; `stop` blocks until the thread has
//! actually left its loop, except when a worker stops itself.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Receiving,
    Quiescing,
}

struct ControlInner {
    state: WorkerState,
    stopping: bool,
    // bumped on every start; a thread abandoned by a timed-out stop keeps the
    // old value and can no longer touch the state
    generation: u64,
    thread: Option<ThreadId>,
    handle: Option<JoinHandle<()>>,
}

pub struct WorkerControl {
    name: &'static str,
    inner: Mutex<ControlInner>,
    cond: Condvar,
}

/// Given to the worker body; answers "should I keep going".
#[derive(Clone)]
pub struct WorkerHandle {
    control: Arc<WorkerControl>,
    generation: u64,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        let inner = lock(&self.control.inner);
        inner.generation == self.generation
            && !inner.stopping
            && inner.state != WorkerState::Stopped
    }

    pub fn set_state(&self, state: WorkerState) {
        let mut inner = lock(&self.control.inner);
        if inner.generation == self.generation && inner.state != WorkerState::Stopped {
            inner.state = state;
        }
    }

    /// Sleeps for `duration` or until stop is requested. Returns whether the
    /// worker should keep running.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut inner = lock(&self.control.inner);
        loop {
            let running = inner.generation == self.generation
                && !inner.stopping
                && inner.state != WorkerState::Stopped;
            let now = Instant::now();
            if !running || now >= deadline {
                return running;
            }
            inner = self
                .control
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

struct ExitGuard(WorkerHandle);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let control = &self.0.control;
        let mut inner = lock(&control.inner);
        if inner.generation == self.0.generation {
            inner.state = WorkerState::Stopped;
            inner.stopping = false;
            inner.thread = None;
        }
        drop(inner);
        control.cond.notify_all();
        debug!(worker = control.name, "worker exited");
    }
}

impl WorkerControl {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(WorkerControl {
            name,
            inner: Mutex::new(ControlInner {
                state: WorkerState::Stopped,
                stopping: false,
                generation: 0,
                thread: None,
                handle: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn state(&self) -> WorkerState {
        lock(&self.inner).state
    }

    pub fn is_running(&self) -> bool {
        let inner = lock(&self.inner);
        !inner.stopping && inner.state != WorkerState::Stopped
    }

    /// True when called from this worker's own thread.
    pub fn is_current_thread(&self) -> bool {
        lock(&self.inner).thread == Some(thread::current().id())
    }

    /// Spawns the worker unless it is already running. Returns `Ok(false)`
    /// when nothing was started.
    pub fn start<F>(self: &Arc<Self>, thread_name: String, body: F) -> io::Result<bool>
    where
        F: FnOnce(WorkerHandle) + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        if inner.state != WorkerState::Stopped {
            return Ok(false);
        }
        // reap a previous thread that stopped itself
        if let Some(old) = inner.handle.take() {
            if old.is_finished() {
                let _ = old.join();
            }
        }
        inner.generation += 1;
        inner.state = WorkerState::Running;
        inner.stopping = false;
        let handle = WorkerHandle {
            control: Arc::clone(self),
            generation: inner.generation,
        };
        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            let _guard = ExitGuard(handle.clone());
            body(handle);
        });
        match spawned {
            Ok(join) => {
                inner.thread = Some(join.thread().id());
                inner.handle = Some(join);
                debug!(worker = self.name, "worker started");
                Ok(true)
            }
            Err(e) => {
                inner.state = WorkerState::Stopped;
                Err(e)
            }
        }
    }

    /// Requests the worker to stop and waits for it to exit. A `None`
    /// timeout waits indefinitely. Returns false if the worker was still
    /// running when this returned (self-stop or timeout).
    pub fn stop(&self, timeout: Option<Duration>) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == WorkerState::Stopped {
            let handle = inner.handle.take();
            drop(inner);
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            return true;
        }
        inner.stopping = true;
        self.cond.notify_all();

        if inner.thread == Some(thread::current().id()) {
            return false;
        }

        let generation = inner.generation;
        let deadline = timeout.map(|t| Instant::now() + t);
        while inner.generation == generation && inner.state != WorkerState::Stopped {
            inner = match deadline {
                None => self.cond.wait(inner).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(worker = self.name, "worker did not stop in time, abandoning it");
                        inner.generation += 1;
                        inner.state = WorkerState::Stopped;
                        inner.stopping = false;
                        inner.thread = None;
                        inner.handle = None;
                        return false;
                    }
                    self.cond
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
        let handle = inner.handle.take();
        drop(inner);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        true
    }
}
