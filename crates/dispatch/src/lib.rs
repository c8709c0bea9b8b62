//! # Throttle Dispatch
//!
//! A rate-limited, priority-aware work dispatcher for callers that share one
//! external quota (an API with an operations-per-second ceiling, a crawler's
//! politeness budget).
//!
//! ## Features
//!
//! - **Background work**: fire-and-forget, deduplicated by identifier, run
//!   inline on the pacing thread in FIFO order
//! - **Foreground work**: jumps ahead of all background work, blocks the
//!   caller until done, shares one execution between concurrent callers
//! - **Pacing**: at most `rate` dispatch starts per second, with a small
//!   safety margin
//! - **Failure isolation**: a panicking or failing callable never stops the
//!   pacing loop
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (pending table, idle/running state, lazy pacing thread)    │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                               │
//!                 ▼                               ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │      PriorityQueue        │   │      ForegroundHandle       │
//! │  (foreground, background) │   │  (parked -> released ->     │
//! │                           │   │   completed, many joiners)  │
//! └───────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use throttle_dispatch::prelude::*;
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::new(50.0)).unwrap();
//! dispatcher.background("warm-cache".to_string(), |_: &String| ());
//! dispatcher
//!     .foreground("user-request".to_string(), |id: &String| {
//!         if id.is_empty() { Err("empty id") } else { Ok(()) }
//!     })
//!     .unwrap();
//! assert!(dispatcher.wait(Some(std::time::Duration::from_secs(5))));
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod queue;
pub mod work;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::DispatcherConfig;
    pub use crate::dispatcher::{Dispatcher, DispatcherStats, DispatcherStatus};
    pub use crate::error::{ConfigError, DispatchError};
    pub use crate::work::{Key, WorkOutput};
}

// Re-export key types at crate root
pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherStats, DispatcherStatus};
pub use error::{ConfigError, DispatchError};
pub use handle::{ForegroundHandle, HandleState};
pub use queue::{Pop, PriorityQueue};
pub use work::{boxed, execute, Key, Work, WorkOutput, WorkResult};
