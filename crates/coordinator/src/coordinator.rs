//! Shared-schedule coordinator
//!
//! A [`Coordinator`] presents the dispatcher contract across processes that
//! join the same name. The elected leader owns the only [`Dispatcher`];
//! followers forward every call to it, and the leader calls back into the
//! submitting process to run each callable at dispatch time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use throttle_dispatch::{work, Dispatcher, WorkOutput};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::election::{self, Elected};
use crate::endpoint::Endpoint;
use crate::error::CoordinatorError;
use crate::protocol::SharedKey;
use crate::proxy::Proxy;
use crate::rendezvous::{EndpointRecord, Rendezvous};

/// How long dropping a coordinator waits for its network tasks
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

enum Role<K: SharedKey> {
    Leader {
        dispatcher: Dispatcher<K>,
        endpoint: Endpoint,
        record: EndpointRecord,
    },
    Follower {
        proxy: Proxy<K>,
        record: EndpointRecord,
    },
}

/// One process's membership in a shared schedule
///
/// The API is blocking. Do not call it from inside an async runtime; use
/// `spawn_blocking` there.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use throttle_coordinator::{Coordinator, CoordinatorConfig, FileRendezvous};
/// use throttle_dispatch::DispatcherConfig;
///
/// let config = CoordinatorConfig::new("search-api")
///     .with_dispatcher(DispatcherConfig::new(5.0));
/// let coordinator = Coordinator::<String>::join(config, Arc::new(FileRendezvous::from_env()))?;
///
/// coordinator.background("page-1".to_string(), |id: &String| println!("fetching {id}"))?;
/// coordinator.wait(None);
/// # Ok::<(), throttle_coordinator::CoordinatorError>(())
/// ```
pub struct Coordinator<K: SharedKey> {
    config: CoordinatorConfig,
    rendezvous: Arc<dyn Rendezvous>,
    role: Role<K>,
    handle: Handle,
    runtime: Option<Runtime>,
    shut_down: AtomicBool,
    closed: AtomicBool,
}

impl<K: SharedKey> Coordinator<K> {
    /// Join the schedule named `config.name`, leading it if nobody does
    #[instrument(skip_all, fields(name = %config.name))]
    pub fn join(
        config: CoordinatorConfig,
        rendezvous: Arc<dyn Rendezvous>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("{}-coordinator", config.name))
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let dispatcher = Dispatcher::new(config.dispatcher.clone())?;

        let role = match handle.block_on(election::elect::<K>(&config, rendezvous.as_ref()))? {
            Elected::Leader { listener, record } => {
                let endpoint = Endpoint::start(
                    &handle,
                    listener,
                    record.addr,
                    dispatcher.clone(),
                    config.max_frame_length,
                );
                info!(
                    name = %config.name,
                    addr = %endpoint.addr(),
                    rate = config.dispatcher.rate,
                    "Leading shared schedule"
                );
                Role::Leader {
                    dispatcher,
                    endpoint,
                    record,
                }
            }
            Elected::Follower { proxy, record } => {
                info!(
                    name = %config.name,
                    leader = %record.addr,
                    leader_pid = record.pid,
                    "Following shared schedule"
                );
                Role::Follower { proxy, record }
            }
        };

        Ok(Self {
            config,
            rendezvous,
            role,
            handle,
            runtime: Some(runtime),
            shut_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether this process owns the shared dispatcher
    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// Address of the leader's endpoint (this process's, when leading)
    pub fn endpoint(&self) -> SocketAddr {
        match &self.role {
            Role::Leader { record, .. } | Role::Follower { record, .. } => record.addr,
        }
    }

    /// Shared schedule name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The shared dispatcher, when this process leads
    pub fn dispatcher(&self) -> Option<&Dispatcher<K>> {
        match &self.role {
            Role::Leader { dispatcher, .. } => Some(dispatcher),
            Role::Follower { .. } => None,
        }
    }

    /// Queue work at background priority in the shared schedule
    ///
    /// The callable runs in this process. Returns `false` when suppressed
    /// (duplicate id, or the schedule is shut down).
    #[instrument(level = "debug", skip(self, work), fields(name = %self.config.name))]
    pub fn background<F, R>(&self, id: K, work: F) -> Result<bool, CoordinatorError>
    where
        F: FnOnce(&K) -> R + Send + 'static,
        R: WorkOutput,
    {
        match &self.role {
            Role::Leader { dispatcher, .. } => Ok(dispatcher.background(id, work)),
            Role::Follower { proxy, .. } => proxy.background(id, work::boxed(work)),
        }
    }

    /// Queue work ahead of all background work and block until it has run
    #[instrument(level = "debug", skip(self, work), fields(name = %self.config.name))]
    pub fn foreground<F, R>(&self, id: K, work: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce(&K) -> R + Send + 'static,
        R: WorkOutput,
    {
        match &self.role {
            Role::Leader { dispatcher, .. } => Ok(dispatcher.foreground(id, work)?),
            Role::Follower { proxy, .. } => proxy.foreground(id, work::boxed(work)),
        }
    }

    /// Whether the shared schedule has nothing pending or running
    pub fn idle(&self) -> Result<bool, CoordinatorError> {
        match &self.role {
            Role::Leader { dispatcher, .. } => Ok(dispatcher.idle()),
            Role::Follower { proxy, .. } => proxy.idle(),
        }
    }

    /// Block until the shared schedule is idle or `timeout` elapses
    ///
    /// Returns whether it is idle. A follower that loses the leader returns
    /// `false` immediately.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        match &self.role {
            Role::Leader { dispatcher, .. } => dispatcher.wait(timeout),
            Role::Follower { proxy, .. } => proxy.wait(timeout),
        }
    }

    /// Stop the shared schedule for every process, and leave it
    ///
    /// Idempotent. On a follower the connection stays open until callbacks
    /// it is running have reported back.
    #[instrument(skip(self), fields(name = %self.config.name))]
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(leader = self.is_leader(), "Shutting down shared schedule");

        match &self.role {
            Role::Leader { .. } => self.close(),
            Role::Follower { proxy, .. } => {
                proxy.shutdown();
                self.closed.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Leave the schedule without stopping it for followers
    ///
    /// A leader cannot leave without stopping its dispatcher: it drains the
    /// in-flight item, stops its endpoint and clears its record so the next
    /// process to join is elected.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match &self.role {
            Role::Leader {
                dispatcher,
                endpoint,
                record,
            } => {
                dispatcher.shutdown();
                if dispatcher.is_pacing_thread() {
                    // The in-flight item is our caller; it cannot finish first
                    debug!("Shutting down from inside dispatched work, not waiting for it");
                } else if !dispatcher.wait(Some(self.config.shutdown_timeout)) {
                    warn!(
                        timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                        "In-flight work still running at shutdown timeout"
                    );
                }
                endpoint.stop(&self.handle);

                match self
                    .handle
                    .block_on(self.rendezvous.clear_if(&self.config.name, record))
                {
                    Ok(true) => debug!(addr = %record.addr, "Cleared own endpoint record"),
                    Ok(false) => debug!("Endpoint record already replaced"),
                    Err(e) => warn!(error = %e, "Failed to clear endpoint record"),
                }
            }
            Role::Follower { proxy, .. } => proxy.close(),
        }
    }
}

impl<K: SharedKey> Drop for Coordinator<K> {
    fn drop(&mut self) {
        self.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        }
    }
}
