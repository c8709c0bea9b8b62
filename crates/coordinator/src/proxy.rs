//! Follower proxy
//!
//! Forwards dispatcher calls to the leader and runs this process's callables
//! when the leader calls back. Callables stay in this process; only the
//! identifier and a per-submission token cross the wire.

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use throttle_dispatch::{work, DispatchError, Work};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace, warn};

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::protocol::{codec, Call, Frame, Reply, SharedKey};

type Lines = Framed<TcpStream, LinesCodec>;

struct ProxyState<K> {
    connected: bool,
    /// Shutdown requested; close once `running` drains
    closing: bool,
    replies: HashMap<u64, oneshot::Sender<Reply>>,
    callables: HashMap<u64, Work<K>>,
    /// Callbacks executing right now, by thread
    running: Vec<(ThreadId, K)>,
}

struct ProxyShared<K> {
    leader: SocketAddr,
    frames: mpsc::UnboundedSender<Frame<K>>,
    state: Mutex<ProxyState<K>>,
    next_seq: AtomicU64,
    next_token: AtomicU64,
    close_tx: watch::Sender<bool>,
}

/// Connection to the leader of a shared schedule
pub(crate) struct Proxy<K: SharedKey> {
    shared: Arc<ProxyShared<K>>,
}

impl<K: SharedKey> Proxy<K> {
    /// Connect to the leader endpoint at `addr`
    pub(crate) async fn connect(
        addr: SocketAddr,
        config: &CoordinatorConfig,
    ) -> Result<Self, CoordinatorError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CoordinatorError::connectivity(format!("timed out connecting to {addr}")))?
            .map_err(|e| CoordinatorError::connectivity(format!("failed to connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let (sink, lines) = Framed::new(stream, codec(config.max_frame_length)).split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        let shared = Arc::new(ProxyShared {
            leader: addr,
            frames: frames_tx,
            state: Mutex::new(ProxyState {
                connected: true,
                closing: false,
                replies: HashMap::new(),
                callables: HashMap::new(),
                running: Vec::new(),
            }),
            next_seq: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            close_tx,
        });

        tokio::spawn(write_frames(
            Arc::clone(&shared),
            sink,
            frames_rx,
            close_rx.clone(),
        ));
        tokio::spawn(read_frames(Arc::clone(&shared), lines, close_rx));

        debug!(leader = %addr, "Connected to coordinator");
        Ok(Self { shared })
    }

    /// Liveness check used during election
    pub(crate) async fn check_alive(&self, timeout: Duration) -> Result<bool, CoordinatorError> {
        let reply = self.shared.register(Call::Idle)?;
        let reply = tokio::time::timeout(timeout, reply)
            .await
            .map_err(|_| CoordinatorError::connectivity("liveness check timed out"))?
            .map_err(|_| CoordinatorError::connectivity("connection closed during liveness check"))?;
        match reply {
            Reply::Idle { idle } => Ok(idle),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn background(&self, id: K, work: Work<K>) -> Result<bool, CoordinatorError> {
        let token = self.shared.register_callable(work)?;
        match self.shared.request(Call::Background { id, token }) {
            Ok(Reply::Submitted { accepted }) => {
                if !accepted {
                    self.shared.forget_callable(token);
                }
                Ok(accepted)
            }
            Ok(other) => {
                self.shared.forget_callable(token);
                Err(unexpected(other))
            }
            Err(e) => {
                self.shared.forget_callable(token);
                Err(e)
            }
        }
    }

    pub(crate) fn foreground(&self, id: K, work: Work<K>) -> Result<(), CoordinatorError> {
        if self.shared.is_running_here(&id) {
            trace!(id = ?id, "Foreground call from inside its own callback");
            return Ok(());
        }

        let token = self.shared.register_callable(work)?;
        let reply = self.shared.request(Call::Foreground { id, token });
        // Unused when the call joined an execution registered by someone else
        self.shared.forget_callable(token);

        match reply? {
            Reply::Completed { outcome } => outcome.map_err(CoordinatorError::from),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn idle(&self) -> Result<bool, CoordinatorError> {
        match self.shared.request(Call::Idle)? {
            Reply::Idle { idle } => Ok(idle),
            other => Err(unexpected(other)),
        }
    }

    /// Best effort: a lost connection reports "not idle"
    ///
    /// From inside one of our callbacks the leader's pacing thread is blocked
    /// on that very callback, so report the current state instead of waiting.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.shared.in_callback() {
            warn!("wait() called from inside a running callback");
            return self.idle().unwrap_or(false);
        }

        let timeout_ms = timeout.map(|t| t.as_millis().min(u64::MAX as u128) as u64);
        match self.shared.request(Call::Wait { timeout_ms }) {
            Ok(Reply::Waited { idle }) => idle,
            Ok(other) => {
                warn!(reply = ?other, "Unexpected reply to wait");
                false
            }
            Err(e) => {
                debug!(error = %e, "Wait failed");
                false
            }
        }
    }

    /// Stop the shared schedule, then close this connection
    pub(crate) fn shutdown(&self) {
        match self.shared.request(Call::Shutdown) {
            Ok(Reply::ShutDown) => debug!(leader = %self.shared.leader, "Shared schedule shut down"),
            Ok(other) => warn!(reply = ?other, "Unexpected reply to shutdown"),
            Err(e) => debug!(error = %e, "Shutdown request not delivered"),
        }
        self.close();
    }

    /// Close the connection once no callback of ours is running
    pub(crate) fn close(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            state.closing = true;
            state.running.is_empty()
        };
        if drained {
            self.shared.close_now();
        }
    }
}

impl<K: SharedKey> Drop for Proxy<K> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<K: SharedKey> ProxyShared<K> {
    /// Send `call` and return the receiver for its reply
    fn register(&self, call: Call<K>) -> Result<oneshot::Receiver<Reply>, CoordinatorError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(self.closed_error());
            }
            state.replies.insert(seq, tx);
        }

        if self.frames.send(Frame::Request { seq, call }).is_err() {
            self.state.lock().replies.remove(&seq);
            return Err(self.closed_error());
        }
        Ok(rx)
    }

    /// Send `call` and block for the reply
    fn request(&self, call: Call<K>) -> Result<Reply, CoordinatorError> {
        self.register(call)?.blocking_recv().map_err(|_| {
            CoordinatorError::connectivity(format!(
                "connection to coordinator at {} closed before reply",
                self.leader
            ))
        })
    }

    fn closed_error(&self) -> CoordinatorError {
        CoordinatorError::connectivity(format!(
            "connection to coordinator at {} is closed",
            self.leader
        ))
    }

    fn register_callable(&self, work: Work<K>) -> Result<u64, CoordinatorError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if !state.connected {
            return Err(self.closed_error());
        }
        state.callables.insert(token, work);
        Ok(token)
    }

    fn forget_callable(&self, token: u64) {
        let unused = self.state.lock().callables.remove(&token);
        if unused.is_some() {
            trace!(token, "Forgot callable");
        }
    }

    fn in_callback(&self) -> bool {
        let current = thread::current().id();
        self.state
            .lock()
            .running
            .iter()
            .any(|(thread, _)| *thread == current)
    }

    fn is_running_here(&self, id: &K) -> bool {
        let current = thread::current().id();
        self.state
            .lock()
            .running
            .iter()
            .any(|(thread, running)| *thread == current && running == id)
    }

    fn resolve(&self, seq: u64, reply: Reply) {
        match self.state.lock().replies.remove(&seq) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => warn!(seq, "Reply for an unknown request"),
        }
    }

    /// Run the callable for `token` on the blocking pool and report back
    fn invoke(self: &Arc<Self>, token: u64, id: K) {
        let callable = self.state.lock().callables.remove(&token);
        let shared = Arc::clone(self);

        tokio::task::spawn_blocking(move || {
            let outcome = match callable {
                Some(callable) => {
                    let current = thread::current().id();
                    shared.state.lock().running.push((current, id.clone()));
                    let outcome = work::execute(&id, callable);
                    let mut state = shared.state.lock();
                    if let Some(index) = state
                        .running
                        .iter()
                        .position(|(thread, running)| *thread == current && *running == id)
                    {
                        state.running.swap_remove(index);
                    }
                    outcome
                }
                None => {
                    warn!(token, id = ?id, "Invoked with no registered callable");
                    Err(DispatchError::failed(format!(
                        "no callable registered for token {token}"
                    )))
                }
            };

            let _ = shared.frames.send(Frame::Invoked { token, outcome });

            let drained = {
                let state = shared.state.lock();
                state.closing && state.running.is_empty()
            };
            if drained {
                shared.close_now();
            }
        });
    }

    /// Fail pending requests and drop unclaimed callables
    fn disconnect(&self) {
        let (replies, callables) = {
            let mut state = self.state.lock();
            state.connected = false;
            (
                mem::take(&mut state.replies),
                mem::take(&mut state.callables),
            )
        };
        if !callables.is_empty() {
            debug!(callables = callables.len(), "Dropping callables never invoked");
        }
        drop(replies);
        drop(callables);
    }

    fn close_now(&self) {
        self.disconnect();
        let _ = self.close_tx.send(true);
    }
}

async fn write_frames<K: SharedKey>(
    shared: Arc<ProxyShared<K>>,
    mut sink: SplitSink<Lines, String>,
    mut frames_rx: mpsc::UnboundedReceiver<Frame<K>>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            // Flush frames queued before the close signal
            biased;
            frame = frames_rx.recv() => {
                let Some(frame) = frame else { break };
                let line = match frame.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    warn!(leader = %shared.leader, error = %e, "Coordinator write failed");
                    shared.close_now();
                    break;
                }
            }
            _ = close_rx.changed() => break,
        }
    }

    if let Err(e) = sink.close().await {
        trace!(error = %e, "Error closing coordinator connection");
    }
}

async fn read_frames<K: SharedKey>(
    shared: Arc<ProxyShared<K>>,
    mut lines: SplitStream<Lines>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            next = lines.next() => match next {
                Some(Ok(line)) => match Frame::<K>::decode(&line) {
                    Ok(Frame::Reply { seq, reply }) => shared.resolve(seq, reply),
                    Ok(Frame::Invoke { token, id }) => shared.invoke(token, id),
                    Ok(Frame::Discard { token }) => shared.forget_callable(token),
                    Ok(other) => warn!(frame = ?other, "Unexpected frame from coordinator"),
                    Err(e) => warn!(error = %e, "Dropping malformed frame"),
                },
                Some(Err(e)) => {
                    warn!(leader = %shared.leader, error = %e, "Coordinator connection failed");
                    break;
                }
                None => {
                    debug!(leader = %shared.leader, "Coordinator closed the connection");
                    break;
                }
            }
        }
    }

    shared.close_now();
}

fn unexpected(reply: Reply) -> CoordinatorError {
    CoordinatorError::protocol(format!("unexpected reply: {reply:?}"))
}
