//! Error types for the coordinator

use thiserror::Error;
use throttle_dispatch::{ConfigError, DispatchError};

use crate::rendezvous::RendezvousError;

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rendezvous store failure
    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    /// No leader could be elected or reached
    #[error("no coordinator for {name:?} after {attempts} election attempts")]
    ElectionFailed { name: String, attempts: u32 },

    /// The leader could not be reached, or the connection dropped
    #[error("coordinator unreachable: {0}")]
    Connectivity(String),

    /// The shared execution failed, was discarded, or the schedule is shut down
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Local I/O failure (runtime, listener)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something the protocol does not allow
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CoordinatorError {
    /// Create a connectivity error
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether the error means the leader is gone
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}
