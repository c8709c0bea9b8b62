//! Work callables and per-dispatch failure isolation

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use crate::error::DispatchError;

/// Identifier naming a unit of work
///
/// Blanket-implemented for every type with the required bounds, so plain
/// `String`, `&'static str`, integers or caller-defined keys all work.
pub trait Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Outcome of a work callable
pub type WorkResult = Result<(), String>;

/// Type-erased work callable
///
/// Every callable receives the identifier it was submitted under; callables
/// that do not need it simply ignore the argument.
pub type Work<K> = Box<dyn FnOnce(&K) -> WorkResult + Send + 'static>;

/// Values a work callable may return
///
/// `()` always counts as success; `Result<(), E>` reports `Err` as a failure
/// using the error's `Display` output.
pub trait WorkOutput {
    /// Convert into the dispatcher's outcome
    fn into_result(self) -> WorkResult;
}

impl WorkOutput for () {
    fn into_result(self) -> WorkResult {
        Ok(())
    }
}

impl<E: fmt::Display> WorkOutput for Result<(), E> {
    fn into_result(self) -> WorkResult {
        self.map_err(|e| e.to_string())
    }
}

/// Box a callable into a [`Work`]
pub fn boxed<K, F, R>(work: F) -> Work<K>
where
    F: FnOnce(&K) -> R + Send + 'static,
    R: WorkOutput,
{
    Box::new(move |id: &K| work(id).into_result())
}

/// Run a work callable, isolating panics and reported failures
///
/// A failure is logged with the identifier and returned to the caller; it
/// never unwinds into the thread that runs the work.
pub fn execute<K: fmt::Debug>(id: &K, work: Work<K>) -> Result<(), DispatchError> {
    match panic::catch_unwind(AssertUnwindSafe(|| work(id))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => {
            error!(id = ?id, error = %message, "Work failed");
            Err(DispatchError::WorkFailed { message })
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(id = ?id, panic = %message, "Work panicked");
            Err(DispatchError::WorkFailed {
                message: format!("panicked: {message}"),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
