//! Foreground hand-off
//!
//! A [`ForegroundHandle`] is a one-shot parked execution context. It is created
//! when an identifier is promoted to foreground, stays parked (no thread, no
//! CPU) while the identifier waits in the queue, and is released by the pacing
//! loop with the final arguments. Release spawns the context and returns
//! immediately; the submitting callers join the handle and all unblock
//! together when the work completes.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::DispatchError;
use crate::work::{self, Key, Work};

/// Lifecycle of a foreground handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Waiting in the queue; the work has not started
    Parked,
    /// Released by the pacing loop; the work is running
    Released,
    /// The work finished (or was discarded before release)
    Completed,
}

/// One-shot completion latch shared by every caller waiting on one execution
pub(crate) struct Completion {
    outcome: Mutex<Option<Result<(), DispatchError>>>,
    done: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Publish the outcome and wake every joiner. Only the first call counts.
    pub(crate) fn complete(&self, outcome: Result<(), DispatchError>) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.done.notify_all();
        true
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Block until the outcome is published
    pub(crate) fn join(&self) -> Result<(), DispatchError> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }

    /// Block until the outcome is published or the timeout elapses
    pub(crate) fn join_timeout(&self, timeout: Duration) -> Option<Result<(), DispatchError>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.join());
        };
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                return slot.clone();
            }
        }
    }
}

/// One-shot parked execution context for foreground work
pub struct ForegroundHandle<K> {
    work: Mutex<Option<Work<K>>>,
    completion: Arc<Completion>,
}

impl<K: Key> ForegroundHandle<K> {
    /// Park `work` until the handle is released
    pub fn new(work: Work<K>) -> Arc<Self> {
        Arc::new(Self {
            work: Mutex::new(Some(work)),
            completion: Arc::new(Completion::new()),
        })
    }

    /// Resume the parked context with its final arguments
    ///
    /// Spawns the execution and returns without waiting for it. Exactly one
    /// release is honored; later calls return `false` and do nothing.
    pub fn release(&self, id: K) -> bool {
        let Some(work) = self.work.lock().take() else {
            return false;
        };

        let completion = Arc::clone(&self.completion);
        let spawned = thread::Builder::new()
            .name("foreground-work".to_string())
            .spawn({
                let completion = Arc::clone(&completion);
                move || {
                    debug!(id = ?id, "Foreground work started");
                    let outcome = work::execute(&id, work);
                    completion.complete(outcome);
                }
            });

        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn foreground context");
            completion.complete(Err(DispatchError::failed(format!(
                "failed to spawn foreground context: {e}"
            ))));
        }
        true
    }

    /// Drop the parked work without running it
    ///
    /// Joiners unblock with [`DispatchError::Discarded`]. Has no effect once
    /// the handle was released.
    pub fn discard(&self) -> bool {
        if self.work.lock().take().is_none() {
            return false;
        }
        self.completion.complete(Err(DispatchError::Discarded))
    }

    /// Block until the execution completes and return its outcome
    pub fn join(&self) -> Result<(), DispatchError> {
        self.completion.join()
    }

    /// Like [`join`](Self::join) but gives up after `timeout`
    pub fn join_timeout(&self, timeout: Duration) -> Option<Result<(), DispatchError>> {
        self.completion.join_timeout(timeout)
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandleState {
        if self.completion.is_complete() {
            HandleState::Completed
        } else if self.work.lock().is_some() {
            HandleState::Parked
        } else {
            HandleState::Released
        }
    }

    pub(crate) fn completion(&self) -> Arc<Completion> {
        Arc::clone(&self.completion)
    }
}

impl<K> fmt::Debug for ForegroundHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForegroundHandle")
            .field("parked", &self.work.lock().is_some())
            .field("completed", &self.completion.is_complete())
            .finish()
    }
}
