//! Rendezvous records: how processes find the current leader
//!
//! A rendezvous store holds at most one [`EndpointRecord`] per shared name.
//! Publication is create-if-absent, so exactly one contender wins an empty
//! slot; clearing is compare-and-remove, so a process only ever removes the
//! stale record it observed and never a fresh one published meanwhile.

mod file;
mod memory;

pub use file::FileRendezvous;
pub use memory::InMemoryRendezvous;

use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rendezvous errors
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// Storage I/O failure
    #[error("rendezvous storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Where a leader can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Address of the leader's endpoint
    pub addr: SocketAddr,

    /// Process id of the leader, for diagnostics
    pub pid: u32,

    /// When the record was published
    pub published_at: DateTime<Utc>,
}

impl EndpointRecord {
    /// Record for an endpoint served by this process
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            pid: std::process::id(),
            published_at: Utc::now(),
        }
    }
}

/// Outcome of [`Rendezvous::publish_if_absent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publish {
    /// The slot was empty and now holds our record
    Published,
    /// Another record was already there
    Occupied(EndpointRecord),
}

/// Storage for rendezvous records
///
/// Implementations must make `publish_if_absent` and `clear_if` atomic with
/// respect to each other and to every process using the same store.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Read the current record, if any
    async fn read(&self, name: &str) -> Result<Option<EndpointRecord>, RendezvousError>;

    /// Store `record` unless a record already exists
    async fn publish_if_absent(
        &self,
        name: &str,
        record: &EndpointRecord,
    ) -> Result<Publish, RendezvousError>;

    /// Remove the record only if it still equals `expected`
    ///
    /// Returns whether a record was removed.
    async fn clear_if(&self, name: &str, expected: &EndpointRecord)
        -> Result<bool, RendezvousError>;
}
