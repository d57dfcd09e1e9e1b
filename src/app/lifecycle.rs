//! Lifecycle plumbing shared by the supervisor and its subsystems.
//!
//! - [`ShutdownSignal`]: one-shot "done" broadcast.  Closing is guarded by
//!   an atomic flag, so any number of `fire()` calls from any thread is safe.
//! - [`StateCell`]: current [`SupervisorState`] with forward-only transitions.
//! - [`TaskSet`]: named worker threads joined against a deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, info, warn};

use crate::app::events::SupervisorState;
use crate::error::Error;
use crate::pubsub::{Subscription, SubscriptionRegistry};

// ───────────────────────────────────────────────────────────────
// ShutdownSignal
// ───────────────────────────────────────────────────────────────

struct SignalInner {
    fired: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// Closed exactly once; every receiver observes the disconnect.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(SignalInner {
                fired: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Close the signal.  Returns `true` only for the call that closed it.
    pub fn fire(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Dropping the only Sender disconnects every receiver.
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Receiver for `select!`; becomes ready (disconnected) once fired.
    pub fn receiver(&self) -> Receiver<()> {
        self.inner.rx.clone()
    }

    /// Block until fired.
    pub fn wait(&self) {
        let _ = self.inner.rx.recv();
    }

    /// Sleep for up to `timeout`, waking early if fired.  Returns `true`
    /// if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.inner.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected) | Ok(())
        )
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────
// StateCell
// ───────────────────────────────────────────────────────────────

/// Holds exactly one [`SupervisorState`] and publishes every transition.
pub struct StateCell {
    state: Mutex<SupervisorState>,
    changes: SubscriptionRegistry<SupervisorState>,
}

impl StateCell {
    pub fn new(depth: usize) -> Self {
        Self {
            state: Mutex::new(SupervisorState::Stopped),
            changes: SubscriptionRegistry::new("state", depth),
        }
    }

    pub fn get(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if it is a legal successor.  Returns `false` otherwise.
    pub fn advance(&self, next: SupervisorState) -> bool {
        let mut cur = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !cur.can_advance_to(next) {
            return false;
        }
        info!("Supervisor: {} -> {}", *cur, next);
        *cur = next;
        self.changes.broadcast(next);
        true
    }

    pub fn subscribe(&self) -> Subscription<SupervisorState> {
        self.changes.subscribe()
    }

    pub fn shutdown_subscribers(&self) {
        self.changes.shutdown();
    }
}

// ───────────────────────────────────────────────────────────────
// TaskSet
// ───────────────────────────────────────────────────────────────

/// Named background threads owned by one component.
#[derive(Default)]
pub struct TaskSet {
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &str, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("lnvend-{name}"))
            .spawn(f)
            .map_err(|e| Error::Startup {
                surface: "tasks",
                reason: format!("spawn {name}: {e}"),
            })?;
        debug!("Tasks: spawned '{}'", name);
        self.tasks.push((name.to_string(), handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Join every task, waiting at most `timeout` in total.  Returns the
    /// names of tasks still running at the deadline (those are detached).
    pub fn join_all(&mut self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let (done, pending): (Vec<_>, Vec<_>) = self
                .tasks
                .drain(..)
                .partition(|(_, h)| h.is_finished());
            self.tasks = pending;
            for (name, handle) in done {
                if handle.join().is_err() {
                    warn!("Tasks: '{}' panicked", name);
                }
            }
            if self.tasks.is_empty() {
                return Vec::new();
            }
            if Instant::now() >= deadline {
                let leaked: Vec<String> = self.tasks.drain(..).map(|(n, _)| n).collect();
                warn!("Tasks: {} task(s) did not stop in time: {:?}", leaked.len(), leaked);
                return leaked;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}
