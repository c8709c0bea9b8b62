//! # Throttle Coordinator
//!
//! Shares one [`throttle_dispatch`] schedule between independent processes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   request/reply    ┌──────────────────────────┐
//! │  follower process    │ ─────────────────► │  leader process          │
//! │  Coordinator         │                    │  Coordinator             │
//! │   └─ Proxy           │ ◄───────────────── │   ├─ Endpoint            │
//! │      (callables)     │   invoke/invoked   │   └─ Dispatcher (shared) │
//! └──────────────────────┘                    └──────────────────────────┘
//!            │                                             │
//!            └───────────── Rendezvous record ─────────────┘
//!                     (leader endpoint address)
//! ```
//!
//! Processes find the leader through a [`Rendezvous`] store; the first to
//! publish its endpoint leads, stale records are cleared and re-elected.
//! Ordering and pacing are decided by the leader, while every callable runs
//! in the process that submitted it.

pub mod config;
pub mod coordinator;
mod election;
mod endpoint;
pub mod error;
pub mod protocol;
mod proxy;
pub mod rendezvous;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::CoordinatorConfig;
    pub use crate::coordinator::Coordinator;
    pub use crate::error::CoordinatorError;
    pub use crate::protocol::SharedKey;
    pub use crate::rendezvous::{FileRendezvous, InMemoryRendezvous, Rendezvous};
}

// Re-export key types at crate root
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::CoordinatorError;
pub use protocol::SharedKey;
pub use rendezvous::{
    EndpointRecord, FileRendezvous, InMemoryRendezvous, Publish, Rendezvous, RendezvousError,
};
