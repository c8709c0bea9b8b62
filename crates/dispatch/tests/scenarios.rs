//! Ordering and pacing scenarios for the dispatcher
//!
//! Run with: cargo test -p throttle-dispatch --test scenarios
//!
//! All scenarios use a rate of 10/s (110ms spacing) unless noted. Tests that
//! need work to be queued "while banana runs" hold banana's callable on a
//! [`Gate`] and poll `stats()` instead of sleeping.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use throttle_dispatch::{
    DispatchError, Dispatcher, DispatcherConfig, DispatcherStatus,
};

const WORDS: [&str; 5] = ["apple", "banana", "cake", "donut", "egg"];
const TIMEOUT: Duration = Duration::from_secs(10);

type Log = Arc<Mutex<Vec<String>>>;

fn dispatcher() -> Dispatcher<String> {
    Dispatcher::new(DispatcherConfig::new(10.0).with_name("scenario")).unwrap()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Callable that appends the capitalized identifier to `log`
fn record(log: &Log) -> impl FnOnce(&String) + Send + 'static {
    let log = Arc::clone(log);
    move |id: &String| log.lock().push(capitalize(id))
}

/// Callable that appends a fixed marker to `log`
fn mark(log: &Log, marker: &'static str) -> impl FnOnce(&String) + Send + 'static {
    let log = Arc::clone(log);
    move |_: &String| log.lock().push(marker.to_string())
}

/// Poll `condition` until it holds or the test timeout elapses
fn until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// One-way latch used to hold a callable until the test releases it
#[derive(Clone, Default)]
struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    fn open(&self) {
        let (open, cvar) = &*self.inner;
        *open.lock() = true;
        cvar.notify_all();
    }

    fn wait(&self) -> bool {
        let (open, cvar) = &*self.inner;
        let deadline = Instant::now() + TIMEOUT;
        let mut open = open.lock();
        while !*open {
            if cvar.wait_until(&mut open, deadline).timed_out() {
                break;
            }
        }
        *open
    }
}

/// Submit the five words in background; `hook` runs inside banana's callable
/// before banana is recorded
fn submit_words<H>(dispatcher: &Dispatcher<String>, log: &Log, hook: H)
where
    H: FnOnce() + Send + 'static,
{
    let mut hook = Some(hook);
    for word in WORDS {
        let log = Arc::clone(log);
        let banana_hook = if word == "banana" { hook.take() } else { None };
        let accepted = dispatcher.background(word.to_string(), move |id: &String| {
            if let Some(hook) = banana_hook {
                hook();
            }
            log.lock().push(capitalize(id));
        });
        assert!(accepted, "{word} should be accepted");
    }
}

// ============================================
// Ordering scenarios
// ============================================

#[test_log::test]
fn test_background_runs_in_submission_order() {
    let dispatcher = dispatcher();
    let log = Log::default();

    for word in WORDS {
        assert!(dispatcher.background(word.to_string(), record(&log)));
    }

    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(*log.lock(), ["Apple", "Banana", "Cake", "Donut", "Egg"]);
    assert!(dispatcher.idle());
}

#[test]
fn test_sequential_foreground_runs_in_call_order() {
    let dispatcher = dispatcher();
    let log = Log::default();

    for word in WORDS {
        assert_eq!(dispatcher.foreground(word.to_string(), record(&log)), Ok(()));
        // Foreground returns only after the work ran
        assert_eq!(log.lock().last().map(String::as_str), Some(capitalize(word).as_str()));
    }

    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(*log.lock(), ["Apple", "Banana", "Cake", "Donut", "Egg"]);
}

#[test]
fn test_background_resubmission_while_in_flight_is_suppressed() {
    let dispatcher = dispatcher();
    let log = Log::default();
    let accepted = Arc::new(AtomicBool::new(true));

    let inner = dispatcher.clone();
    let hook_log = Arc::clone(&log);
    let hook_accepted = Arc::clone(&accepted);
    submit_words(&dispatcher, &log, move || {
        let again = inner.background("banana".to_string(), mark(&hook_log, "BANANAYO"));
        hook_accepted.store(again, Ordering::SeqCst);
    });

    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert!(!accepted.load(Ordering::SeqCst));
    assert_eq!(*log.lock(), ["Apple", "Banana", "Cake", "Donut", "Egg"]);
}

#[test]
fn test_background_resubmission_while_queued_keeps_first_registration() {
    let dispatcher = dispatcher();
    let log = Log::default();
    let accepted = Arc::new(AtomicBool::new(true));

    let inner = dispatcher.clone();
    let hook_log = Arc::clone(&log);
    let hook_accepted = Arc::clone(&accepted);
    submit_words(&dispatcher, &log, move || {
        let again = inner.background("cake".to_string(), mark(&hook_log, "CAKEYO"));
        hook_accepted.store(again, Ordering::SeqCst);
    });

    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert!(!accepted.load(Ordering::SeqCst));
    assert_eq!(*log.lock(), ["Apple", "Banana", "Cake", "Donut", "Egg"]);
}

#[test]
fn test_foreground_from_inside_own_execution_returns_immediately() {
    let dispatcher = dispatcher();
    let log = Log::default();
    let outcome = Arc::new(Mutex::new(None));

    let inner = dispatcher.clone();
    let hook_log = Arc::clone(&log);
    let hook_outcome = Arc::clone(&outcome);
    submit_words(&dispatcher, &log, move || {
        let result = inner.foreground("banana".to_string(), mark(&hook_log, "BANANAYO"));
        *hook_outcome.lock() = Some(result);
    });

    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(*outcome.lock(), Some(Ok(())));
    assert_eq!(*log.lock(), ["Apple", "Banana", "Cake", "Donut", "Egg"]);
}

#[test_log::test]
fn test_foreground_joins_in_flight_execution() {
    let dispatcher = dispatcher();
    let log = Log::default();
    let started = Gate::default();

    let hook_started = started.clone();
    submit_words(&dispatcher, &log, move || {
        hook_started.open();
        thread::sleep(Duration::from_millis(150));
    });

    assert!(started.wait());
    let result = dispatcher.foreground("banana".to_string(), mark(&log, "BANANAYO"));
    assert_eq!(result, Ok(()));
    // Returned only once banana's own execution finished
    assert!(log.lock().iter().any(|entry| entry == "Banana"));

    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(*log.lock(), ["Apple", "Banana", "Cake", "Donut", "Egg"]);
}

#[test]
fn test_foreground_replaces_queued_background_work() {
    let dispatcher = dispatcher();
    let log = Log::default();
    let submitter: Arc<Mutex<Option<JoinHandle<Result<(), DispatchError>>>>> =
        Arc::new(Mutex::new(None));

    let inner = dispatcher.clone();
    let hook_log = Arc::clone(&log);
    let hook_submitter = Arc::clone(&submitter);
    submit_words(&dispatcher, &log, move || {
        let remote = inner.clone();
        let cakeyo = mark(&hook_log, "CAKEYO");
        *hook_submitter.lock() = Some(thread::spawn(move || {
            remote.foreground("cake".to_string(), cakeyo)
        }));
        assert!(until(|| inner.stats().queued_foreground == 1));
    });

    assert!(dispatcher.wait(Some(TIMEOUT)));
    let handle = submitter.lock().take().unwrap();
    assert_eq!(handle.join().unwrap(), Ok(()));
    assert_eq!(*log.lock(), ["Apple", "Banana", "CAKEYO", "Donut", "Egg"]);
}

#[test_log::test]
fn test_foreground_preempts_background() {
    let dispatcher = dispatcher();
    let log = Log::default();
    let started = Gate::default();
    let go = Gate::default();

    let (hook_started, hook_go) = (started.clone(), go.clone());
    submit_words(&dispatcher, &log, move || {
        hook_started.open();
        hook_go.wait();
    });

    assert!(started.wait());
    let mut submitters = vec![];
    for (position, word) in ["fish", "grape"].into_iter().enumerate() {
        let remote = dispatcher.clone();
        let work = record(&log);
        submitters.push(thread::spawn(move || remote.foreground(word.to_string(), work)));
        assert!(until(|| dispatcher.stats().queued_foreground == position + 1));
    }
    go.open();

    for submitter in submitters {
        assert_eq!(submitter.join().unwrap(), Ok(()));
    }
    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(
        *log.lock(),
        ["Apple", "Banana", "Fish", "Grape", "Cake", "Donut", "Egg"]
    );
}

#[test_log::test]
fn test_shutdown_inside_work_stops_schedule() {
    let dispatcher = dispatcher();
    let log = Log::default();

    let inner = dispatcher.clone();
    submit_words(&dispatcher, &log, move || inner.shutdown());

    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(*log.lock(), ["Apple", "Banana"]);

    let stats = dispatcher.stats();
    assert!(stats.closed);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.status, DispatcherStatus::Idle);
}

// ============================================
// Foreground sharing and shutdown
// ============================================

#[test]
fn test_concurrent_foreground_calls_share_one_execution() {
    let dispatcher = dispatcher();
    let log = Log::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let started = Gate::default();
    let go = Gate::default();

    // Occupy the pacing thread so fish stays queued
    let (hook_started, hook_go) = (started.clone(), go.clone());
    dispatcher.background("banana".to_string(), move |_: &String| {
        hook_started.open();
        hook_go.wait();
    });
    assert!(started.wait());

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let remote = dispatcher.clone();
            let runs = Arc::clone(&runs);
            thread::spawn(move || {
                remote.foreground("fish".to_string(), move |_: &String| {
                    thread::sleep(Duration::from_millis(50));
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
        })
        .collect();

    assert!(until(|| dispatcher.stats().queued_foreground == 1));
    // Let the second caller find the queued handle
    thread::sleep(Duration::from_millis(100));
    go.open();

    for caller in callers {
        assert_eq!(caller.join().unwrap(), Ok(()));
    }
    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(log.lock().is_empty());
}

#[test]
fn test_shutdown_discards_queued_foreground() {
    let dispatcher = dispatcher();
    let log = Log::default();
    let started = Gate::default();
    let go = Gate::default();

    let (hook_started, hook_go) = (started.clone(), go.clone());
    let banana_log = Arc::clone(&log);
    dispatcher.background("banana".to_string(), move |id: &String| {
        hook_started.open();
        hook_go.wait();
        banana_log.lock().push(capitalize(id));
    });
    dispatcher.background("cake".to_string(), record(&log));
    assert!(started.wait());

    let remote = dispatcher.clone();
    let fish = record(&log);
    let caller = thread::spawn(move || remote.foreground("fish".to_string(), fish));
    assert!(until(|| dispatcher.stats().queued_foreground == 1));

    dispatcher.shutdown();
    assert_eq!(caller.join().unwrap(), Err(DispatchError::Discarded));
    // Banana is still in flight
    assert!(!dispatcher.idle());

    go.open();
    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(*log.lock(), ["Banana"]);
}

#[test]
fn test_failing_work_does_not_stop_pacing() {
    let dispatcher = dispatcher();
    let log = Log::default();

    dispatcher.background("apple".to_string(), |_: &String| -> () {
        panic!("apple exploded")
    });
    dispatcher.background("banana".to_string(), |_: &String| Err::<(), _>("banana refused"));
    dispatcher.background("cake".to_string(), record(&log));

    let result = dispatcher.foreground("donut".to_string(), |_: &String| -> () {
        panic!("donut exploded")
    });
    assert_eq!(
        result,
        Err(DispatchError::failed("panicked: donut exploded"))
    );

    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(*log.lock(), ["Cake"]);
}

// ============================================
// Pacing and concurrency
// ============================================

#[test]
fn test_background_dispatches_respect_rate() {
    let dispatcher = Dispatcher::new(DispatcherConfig::new(20.0)).unwrap();
    let starts = Arc::new(Mutex::new(Vec::new()));

    for id in 0..5u32 {
        let starts = Arc::clone(&starts);
        dispatcher.background(id, move |_: &u32| starts.lock().push(Instant::now()));
    }
    assert!(dispatcher.wait(Some(TIMEOUT)));

    let starts = starts.lock();
    assert_eq!(starts.len(), 5);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(50));
    }
    assert!(starts[4] - starts[0] >= Duration::from_millis(200));
}

#[test]
fn test_foreground_executions_overlap() {
    let dispatcher = Dispatcher::new(DispatcherConfig::new(50.0)).unwrap();
    let begin = Instant::now();

    let callers: Vec<_> = (0..3u32)
        .map(|id| {
            let remote = dispatcher.clone();
            thread::spawn(move || {
                remote.foreground(id, |_: &u32| thread::sleep(Duration::from_millis(300)))
            })
        })
        .collect();

    for caller in callers {
        assert_eq!(caller.join().unwrap(), Ok(()));
    }
    // Serialized execution would take at least 900ms
    assert!(begin.elapsed() < Duration::from_millis(800));
    assert!(dispatcher.wait(Some(TIMEOUT)));
}

#[test]
fn test_id_can_be_resubmitted_while_handed_off_work_runs() {
    let dispatcher = dispatcher();
    let started = Gate::default();
    let go = Gate::default();

    let remote = dispatcher.clone();
    let (hook_started, hook_go) = (started.clone(), go.clone());
    let caller = thread::spawn(move || {
        remote.foreground("fish".to_string(), move |_: &String| {
            hook_started.open();
            hook_go.wait();
        })
    });
    assert!(started.wait());

    let log = Log::default();
    assert!(dispatcher.background("fish".to_string(), record(&log)));

    go.open();
    assert_eq!(caller.join().unwrap(), Ok(()));
    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert_eq!(*log.lock(), ["Fish"]);
}

#[test]
fn test_idle_tracks_pending_work() {
    let dispatcher = dispatcher();
    assert!(dispatcher.idle());

    let started = Gate::default();
    let go = Gate::default();
    let (hook_started, hook_go) = (started.clone(), go.clone());
    dispatcher.background("apple".to_string(), move |_: &String| {
        hook_started.open();
        hook_go.wait();
    });
    dispatcher.background("banana".to_string(), |_: &String| ());

    assert!(started.wait());
    assert!(!dispatcher.idle());
    let stats = dispatcher.stats();
    assert!(stats.in_flight);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.queued_background, 1);

    go.open();
    assert!(dispatcher.wait(Some(TIMEOUT)));
    assert!(dispatcher.idle());
}
