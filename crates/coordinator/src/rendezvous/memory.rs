//! In-memory rendezvous store for tests

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{EndpointRecord, Publish, Rendezvous, RendezvousError};

/// In-memory implementation of [`Rendezvous`]
///
/// Only coordinates coordinators inside one process. Share it through an
/// `Arc` to let several in-process coordinators elect a leader.
///
/// # Example
///
/// ```
/// use throttle_coordinator::InMemoryRendezvous;
///
/// let rendezvous = InMemoryRendezvous::new();
/// assert!(rendezvous.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryRendezvous {
    records: RwLock<HashMap<String, EndpointRecord>>,
}

impl InMemoryRendezvous {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record unconditionally
    pub fn insert(&self, name: &str, record: EndpointRecord) {
        self.records.write().insert(name.to_string(), record);
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl Rendezvous for InMemoryRendezvous {
    async fn read(&self, name: &str) -> Result<Option<EndpointRecord>, RendezvousError> {
        Ok(self.records.read().get(name).cloned())
    }

    async fn publish_if_absent(
        &self,
        name: &str,
        record: &EndpointRecord,
    ) -> Result<Publish, RendezvousError> {
        let mut records = self.records.write();
        if let Some(existing) = records.get(name) {
            return Ok(Publish::Occupied(existing.clone()));
        }
        records.insert(name.to_string(), record.clone());
        Ok(Publish::Published)
    }

    async fn clear_if(
        &self,
        name: &str,
        expected: &EndpointRecord,
    ) -> Result<bool, RendezvousError> {
        let mut records = self.records.write();
        if records.get(name) == Some(expected) {
            records.remove(name);
            return Ok(true);
        }
        Ok(false)
    }
}
