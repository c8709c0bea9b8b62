//! Error types for the dispatcher

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Rate must be a positive, finite number of dispatches per second
    #[error("refusing to dispatch at rate {0}: rate must be positive and finite")]
    InvalidRate(f64),

    /// An environment variable could not be parsed
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    /// Any other invalid setting
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Outcome errors reported to callers that wait on a dispatch
///
/// Serializable so a leader can report a foreground outcome to a caller in
/// another process.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    /// The work ran and failed (returned an error or panicked)
    #[error("work failed: {message}")]
    WorkFailed { message: String },

    /// The work was queued but discarded by shutdown before dispatch
    #[error("work was discarded by shutdown before dispatch")]
    Discarded,

    /// The dispatcher was already shut down when the work was submitted
    #[error("dispatcher is shut down")]
    ShutDown,
}

impl DispatchError {
    /// Create a work failure error
    pub fn failed(message: impl Into<String>) -> Self {
        DispatchError::WorkFailed {
            message: message.into(),
        }
    }
}
