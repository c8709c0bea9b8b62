//! Rate-limited dispatcher
//!
//! Owns the [`PriorityQueue`], the pending-work table and a lazily started
//! pacing thread. Every mutation of that state happens under one exclusive
//! section (`Shared::state`); work callables, handle release and completion
//! signalling always run with the section released.
//!
//! ```text
//!  background(id) ──┐                         ┌──► run inline, wait for return
//!                   ├─► PriorityQueue ─► pacer┤
//!  foreground(id) ──┘   (fg before bg)        └──► release ForegroundHandle
//!        │                                              │
//!        └──────────── join ◄───────────────────────────┘
//! ```

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::error::{ConfigError, DispatchError};
use crate::handle::{Completion, ForegroundHandle};
use crate::queue::{Pop, PriorityQueue};
use crate::work::{self, Key, Work, WorkOutput};

/// Dispatcher state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherStatus {
    /// No pacing thread is running
    Idle,
    /// The pacing thread is draining the queue
    Running,
}

/// Point-in-time view of a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Pacing loop state
    pub status: DispatcherStatus,
    /// Entries in the pending table (queued plus in flight)
    pub pending: usize,
    /// Identifiers waiting in the foreground sequence
    pub queued_foreground: usize,
    /// Identifiers waiting in the background sequence
    pub queued_background: usize,
    /// Whether a background dispatch is executing right now
    pub in_flight: bool,
    /// Whether the dispatcher was shut down
    pub closed: bool,
}

/// Work registered under an identifier
enum Registered<K> {
    /// Plain callable, run inline by the pacing thread
    Background(Work<K>),
    /// Parked context, released by the pacing thread
    Foreground(Arc<ForegroundHandle<K>>),
    /// Popped and executing; keeps the id in the table for dedup
    Dispatched,
}

/// The background dispatch currently executing on the pacing thread
struct InFlight<K> {
    id: K,
    completion: Arc<Completion>,
    executor: ThreadId,
}

struct State<K> {
    queue: PriorityQueue<K>,
    pending: HashMap<K, Registered<K>>,
    status: DispatcherStatus,
    /// Pacing origin; `None` until the first dispatch
    last_dispatch: Option<Instant>,
    in_flight: Option<InFlight<K>>,
    pacer: Option<JoinHandle<()>>,
}

struct Shared<K> {
    config: DispatcherConfig,
    spacing: Duration,
    state: Mutex<State<K>>,
    /// Wakes the pacing thread: new arrivals and shutdown
    wakeup: Condvar,
    /// Wakes `wait` callers on the transition to idle
    idle: Condvar,
}

/// Rate-limited, priority-aware work dispatcher
///
/// Cloning is cheap and yields another handle to the same dispatcher, so work
/// callables can capture it to resubmit or shut down.
///
/// # Example
///
/// ```
/// use throttle_dispatch::{Dispatcher, DispatcherConfig};
/// use std::sync::{Arc, Mutex};
///
/// let dispatcher = Dispatcher::new(DispatcherConfig::new(20.0)).unwrap();
/// let fetched = Arc::new(Mutex::new(Vec::new()));
///
/// for page in [1u32, 2] {
///     let fetched = Arc::clone(&fetched);
///     dispatcher.background(page, move |id: &u32| fetched.lock().unwrap().push(*id));
/// }
///
/// // Jump the queue and block until page 3 has run
/// let out = Arc::clone(&fetched);
/// dispatcher
///     .foreground(3, move |id: &u32| out.lock().unwrap().push(*id))
///     .unwrap();
///
/// dispatcher.wait(None);
/// assert_eq!(fetched.lock().unwrap().len(), 3);
/// dispatcher.shutdown();
/// ```
pub struct Dispatcher<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Dispatcher<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Key> Dispatcher<K> {
    /// Create a dispatcher; fails if the rate is not positive
    pub fn new(config: DispatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let spacing = config.spacing();

        debug!(
            name = %config.name,
            rate = config.rate,
            spacing_ms = spacing.as_millis() as u64,
            "Creating dispatcher"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                spacing,
                state: Mutex::new(State {
                    queue: PriorityQueue::new(),
                    pending: HashMap::new(),
                    status: DispatcherStatus::Idle,
                    last_dispatch: None,
                    in_flight: None,
                    pacer: None,
                }),
                wakeup: Condvar::new(),
                idle: Condvar::new(),
            }),
        })
    }

    /// Queue work at background priority and return immediately
    ///
    /// Suppressed (returns `false`) when `id` is already queued or in flight,
    /// or when the dispatcher was shut down. The first registration wins: a
    /// suppressed call never replaces the queued callable.
    pub fn background<F, R>(&self, id: K, work: F) -> bool
    where
        F: FnOnce(&K) -> R + Send + 'static,
        R: WorkOutput,
    {
        self.submit_background(id, work::boxed(work))
    }

    /// Type-erased form of [`background`](Self::background)
    pub fn submit_background(&self, id: K, work: Work<K>) -> bool {
        let mut state = self.shared.state.lock();

        if state.queue.is_closed() {
            debug!(id = ?id, "Dispatcher shut down, ignoring background work");
            return false;
        }
        if state.pending.contains_key(&id) {
            trace!(id = ?id, "Suppressing duplicate background work");
            return false;
        }

        state
            .pending
            .insert(id.clone(), Registered::Background(work));
        if state.queue.submit_background(id) {
            self.shared.wakeup.notify_one();
        }
        Shared::ensure_running(&self.shared, &mut state);
        true
    }

    /// Queue work ahead of all background work and block until it has run
    ///
    /// - If `id` is executing right now, waits for that execution instead of
    ///   starting another one (returns at once when called from inside it).
    /// - If `id` is already waiting in foreground, shares that execution; the
    ///   given `work` is dropped.
    /// - If `id` is waiting in background, it is promoted and `work` replaces
    ///   the background callable.
    ///
    /// Calling this from inside background work for a *different* id blocks
    /// forever: the pacing thread is the caller, so nothing dispatches.
    pub fn foreground<F, R>(&self, id: K, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&K) -> R + Send + 'static,
        R: WorkOutput,
    {
        self.submit_foreground(id, work::boxed(work))
    }

    /// Type-erased form of [`foreground`](Self::foreground)
    pub fn submit_foreground(&self, id: K, work: Work<K>) -> Result<(), DispatchError> {
        let completion = {
            let mut state = self.shared.state.lock();

            let in_flight = state.in_flight.as_ref().filter(|f| f.id == id);
            if let Some(in_flight) = in_flight {
                if in_flight.executor == thread::current().id() {
                    trace!(id = ?id, "Foreground call from inside its own execution");
                    return Ok(());
                }
                debug!(id = ?id, "Joining in-flight execution");
                Arc::clone(&in_flight.completion)
            } else if state.queue.is_closed() {
                return Err(DispatchError::ShutDown);
            } else if let Some(Registered::Foreground(handle)) = state.pending.get(&id) {
                debug!(id = ?id, "Sharing queued foreground execution");
                handle.completion()
            } else {
                let handle = ForegroundHandle::new(work);
                let completion = handle.completion();
                state
                    .pending
                    .insert(id.clone(), Registered::Foreground(handle));
                if state.queue.submit_foreground(id) {
                    self.shared.wakeup.notify_one();
                }
                Shared::ensure_running(&self.shared, &mut state);
                completion
            }
        };

        completion.join()
    }

    /// Whether nothing is pending and the pacing loop is not running
    pub fn idle(&self) -> bool {
        Shared::is_idle(&self.shared.state.lock())
    }

    /// Block until the dispatcher is idle or `timeout` elapses
    ///
    /// Returns whether the dispatcher is idle. `None` waits indefinitely.
    /// Called from the pacing thread itself (inside background work), it
    /// cannot become idle while blocking, so it returns immediately.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        // A timeout too large to represent waits indefinitely
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.shared.state.lock();

        if Shared::on_pacer(&state) {
            warn!("wait() called from inside background work");
            return Shared::is_idle(&state);
        }

        loop {
            if Shared::is_idle(&state) {
                return true;
            }

            // Queued entries with no pacing thread: a start was lost, resume.
            if state.status == DispatcherStatus::Idle
                && !state.queue.is_closed()
                && !state.queue.is_empty()
            {
                warn!("Found queued work with no pacing thread, restarting");
                Shared::ensure_running(&self.shared, &mut state);
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .idle
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Shared::is_idle(&state);
                    }
                }
                None => self.shared.idle.wait(&mut state),
            }
        }
    }

    /// Stop dispatching and discard everything not yet started
    ///
    /// The in-flight item (if any) runs to completion. Queued foreground
    /// callers unblock with [`DispatchError::Discarded`]. Idempotent and safe
    /// to call from inside a work callable.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            if !state.queue.shutdown() {
                return;
            }

            let keep = state.in_flight.as_ref().map(|f| f.id.clone());
            let pending = mem::take(&mut state.pending);
            let mut discarded = Vec::with_capacity(pending.len());
            for (id, registered) in pending {
                if keep.as_ref() == Some(&id) {
                    state.pending.insert(id, registered);
                } else {
                    discarded.push(registered);
                }
            }

            info!(
                name = %self.shared.config.name,
                discarded = discarded.len(),
                in_flight = keep.is_some(),
                "Dispatcher shutting down"
            );

            self.shared.wakeup.notify_all();
            if Shared::is_idle(&state) {
                self.shared.idle.notify_all();
            }
            discarded
        };

        for registered in discarded {
            if let Registered::Foreground(handle) = registered {
                handle.discard();
            }
        }
    }

    /// Whether the caller is running background work on the pacing thread
    ///
    /// Nothing can become idle while such a caller blocks.
    pub fn is_pacing_thread(&self) -> bool {
        Shared::on_pacer(&self.shared.state.lock())
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().queue.is_closed()
    }

    /// Snapshot of the dispatcher's state
    pub fn stats(&self) -> DispatcherStats {
        let state = self.shared.state.lock();
        DispatcherStats {
            status: state.status,
            pending: state.pending.len(),
            queued_foreground: state.queue.foreground_len(),
            queued_background: state.queue.background_len(),
            in_flight: state.in_flight.is_some(),
            closed: state.queue.is_closed(),
        }
    }

    /// The configuration this dispatcher was built with
    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }
}

impl<K: Key> Shared<K> {
    fn on_pacer(state: &State<K>) -> bool {
        state
            .pacer
            .as_ref()
            .is_some_and(|pacer| pacer.thread().id() == thread::current().id())
    }

    fn is_idle(state: &State<K>) -> bool {
        state.status == DispatcherStatus::Idle && state.pending.is_empty()
    }

    /// Start the pacing thread unless it is already running
    fn ensure_running(shared: &Arc<Self>, state: &mut State<K>) {
        if state.status == DispatcherStatus::Running {
            return;
        }

        let pacer = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-pacer", shared.config.name))
            .spawn(move || pacer.run());

        match spawned {
            Ok(handle) => {
                state.status = DispatcherStatus::Running;
                state.pacer = Some(handle);
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn pacing thread");
            }
        }
    }

    /// Pacing loop: drain the queue at the configured rate, then go idle
    fn run(&self) {
        let mut state = self.state.lock();
        debug!(name = %self.config.name, "Pacing loop started");

        // The emptiness check and the idle transition happen under the same
        // guard, so a submission either sees `Running` or starts a new loop.
        while !state.queue.is_closed() && !state.queue.is_empty() {
            self.pace(&mut state);

            let Some(id) = self.pop(&mut state) else {
                continue;
            };
            self.dispatch(&mut state, id);
            // Background work paces by completion, foreground by hand-off
            state.last_dispatch = Some(Instant::now());
        }

        state.status = DispatcherStatus::Idle;
        state.pacer = None;
        self.idle.notify_all();
        debug!(name = %self.config.name, "Pacing loop exited");
    }

    /// Wait out the remainder of the spacing interval since the last dispatch
    fn pace(&self, state: &mut MutexGuard<'_, State<K>>) {
        let Some(origin) = state.last_dispatch else {
            return;
        };

        loop {
            let elapsed = origin.elapsed();
            if elapsed >= self.spacing || state.queue.is_closed() {
                return;
            }
            self.wakeup.wait_for(state, self.spacing - elapsed);
        }
    }

    /// Blocking pop; `None` once the queue is closed
    fn pop(&self, state: &mut MutexGuard<'_, State<K>>) -> Option<K> {
        loop {
            match state.queue.pop() {
                Pop::Item(id) => return Some(id),
                Pop::Closed => return None,
                Pop::Empty => self.wakeup.wait(state),
            }
        }
    }

    /// Run background work inline or hand off foreground work
    fn dispatch(&self, state: &mut MutexGuard<'_, State<K>>, id: K) {
        let registered = match state.pending.get_mut(&id) {
            Some(entry) => mem::replace(entry, Registered::Dispatched),
            None => {
                warn!(id = ?id, "Popped an identifier with no registered work");
                return;
            }
        };

        match registered {
            Registered::Background(work) => {
                let completion = Arc::new(Completion::new());
                state.in_flight = Some(InFlight {
                    id: id.clone(),
                    completion: Arc::clone(&completion),
                    executor: thread::current().id(),
                });

                debug!(id = ?id, "Dispatching background work");
                MutexGuard::unlocked(state, || {
                    let outcome = work::execute(&id, work);
                    completion.complete(outcome);
                });

                state.in_flight = None;
                state.pending.remove(&id);
            }
            Registered::Foreground(handle) => {
                // Removed before the work finishes: the id may be resubmitted
                // while the handed-off execution is still running.
                state.pending.remove(&id);
                debug!(id = ?id, "Handing off foreground work");
                MutexGuard::unlocked(state, || {
                    handle.release(id);
                });
            }
            Registered::Dispatched => {
                warn!(id = ?id, "Identifier dispatched twice");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(rate: f64) -> Dispatcher<u32> {
        Dispatcher::new(DispatcherConfig::new(rate)).unwrap()
    }

    #[test]
    fn test_rejects_invalid_rate() {
        assert!(matches!(
            Dispatcher::<u32>::new(DispatcherConfig::new(0.0)),
            Err(ConfigError::InvalidRate(_))
        ));
    }

    #[test]
    fn test_starts_idle() {
        let dispatcher = dispatcher(10.0);
        assert!(dispatcher.idle());
        assert!(dispatcher.wait(Some(Duration::ZERO)));
        assert_eq!(
            dispatcher.stats(),
            DispatcherStats {
                status: DispatcherStatus::Idle,
                pending: 0,
                queued_foreground: 0,
                queued_background: 0,
                in_flight: false,
                closed: false,
            }
        );
    }

    #[test]
    fn test_duplicate_background_is_suppressed() {
        let dispatcher = dispatcher(10.0);
        let (tx, rx) = std::sync::mpsc::channel();

        let first = tx.clone();
        assert!(dispatcher.background(1, move |_| first.send("first").unwrap()));
        assert!(!dispatcher.background(1, move |_| tx.send("second").unwrap()));

        assert!(dispatcher.wait(Some(Duration::from_secs(5))));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["first"]);
    }

    #[test]
    fn test_pacing_thread_exits_when_drained_and_restarts() {
        let dispatcher = dispatcher(50.0);
        dispatcher.background(1, |_| ());
        assert!(dispatcher.wait(Some(Duration::from_secs(5))));
        assert_eq!(dispatcher.stats().status, DispatcherStatus::Idle);

        let (tx, rx) = std::sync::mpsc::channel();
        dispatcher.background(2, move |id| tx.send(*id).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(2));
        assert!(dispatcher.wait(Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_rejects_rate_whose_spacing_overflows() {
        assert!(matches!(
            Dispatcher::<u32>::new(DispatcherConfig::new(1e-20)),
            Err(ConfigError::InvalidRate(_))
        ));
    }

    #[test]
    fn test_wait_with_unrepresentable_timeout() {
        let dispatcher = dispatcher(20.0);
        assert!(dispatcher.wait(Some(Duration::MAX)));

        dispatcher.background(1, |_| thread::sleep(Duration::from_millis(50)));
        assert!(dispatcher.wait(Some(Duration::MAX)));
    }

    #[test]
    fn test_wait_times_out_while_busy() {
        let dispatcher = dispatcher(10.0);
        dispatcher.background(1, |_| thread::sleep(Duration::from_millis(300)));

        assert!(!dispatcher.wait(Some(Duration::from_millis(20))));
        assert!(!dispatcher.idle());
        assert!(dispatcher.wait(Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_submissions_after_shutdown() {
        let dispatcher = dispatcher(10.0);
        dispatcher.shutdown();
        dispatcher.shutdown();

        assert!(dispatcher.is_shut_down());
        assert!(!dispatcher.background(1, |_| ()));
        assert_eq!(
            dispatcher.foreground(2, |_| ()),
            Err(DispatchError::ShutDown)
        );
        assert!(dispatcher.idle());
    }

    #[test]
    fn test_wait_inside_background_work_returns() {
        let dispatcher = dispatcher(10.0);
        let inner = dispatcher.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        dispatcher.background(1, move |_| {
            tx.send((inner.is_pacing_thread(), inner.wait(None))).unwrap()
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok((true, false)));
        assert!(!dispatcher.is_pacing_thread());
        assert!(dispatcher.wait(Some(Duration::from_secs(5))));
    }
}
