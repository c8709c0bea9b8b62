//! Leader endpoint
//!
//! Serves the shared [`Dispatcher`] to followers. Each follower connection
//! gets a session: requests are answered on the blocking pool (dispatcher
//! calls block), and work submitted by a follower is registered with the
//! dispatcher as a callback that asks the follower to run its own callable.

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use throttle_dispatch::{DispatchError, Dispatcher};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{codec, Call, Frame, Outcome, Reply, SharedKey};

/// Outcome reported for callbacks whose follower went away
const DISCONNECTED: &str = "submitter disconnected";

/// Running endpoint; stopped explicitly by the owning coordinator
pub(crate) struct Endpoint {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Start accepting followers on `listener`
    pub(crate) fn start<K: SharedKey>(
        runtime: &Handle,
        listener: TcpListener,
        addr: SocketAddr,
        dispatcher: Dispatcher<K>,
        max_frame_length: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = runtime.spawn(accept_loop(
            listener,
            dispatcher,
            shutdown_rx,
            max_frame_length,
        ));

        Self {
            addr,
            shutdown_tx,
            accept: Mutex::new(Some(accept)),
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, close every session and wait for them to finish
    pub(crate) fn stop(&self, runtime: &Handle) {
        let _ = self.shutdown_tx.send(true);
        let Some(accept) = self.accept.lock().take() else {
            return;
        };
        if let Err(e) = runtime.block_on(accept) {
            warn!(error = %e, "Endpoint accept loop ended abnormally");
        }
        info!(addr = %self.addr, "Coordinator endpoint stopped");
    }
}

async fn accept_loop<K: SharedKey>(
    listener: TcpListener,
    dispatcher: Dispatcher<K>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame_length: usize,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("Accept loop: shutdown requested");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Follower connected");
                    // Reap finished sessions so the set does not grow unbounded
                    while sessions.try_join_next().is_some() {}
                    sessions.spawn(serve(
                        stream,
                        peer,
                        dispatcher.clone(),
                        shutdown_rx.clone(),
                        max_frame_length,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept follower connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    while sessions.join_next().await.is_some() {}
}

/// Callbacks waiting for a follower to report an outcome
struct Callbacks {
    connected: bool,
    waiting: HashMap<u64, oneshot::Sender<Outcome>>,
}

/// The session half that dispatcher callbacks hold on to
struct Link<K> {
    frames: mpsc::UnboundedSender<Frame<K>>,
    callbacks: Arc<Mutex<Callbacks>>,
}

impl<K> Clone for Link<K> {
    fn clone(&self) -> Self {
        Self {
            frames: self.frames.clone(),
            callbacks: Arc::clone(&self.callbacks),
        }
    }
}

impl<K: SharedKey> Link<K> {
    fn send(&self, frame: Frame<K>) -> bool {
        self.frames.send(frame).is_ok()
    }

    /// Dispatcher work that runs the follower's callable `token`
    fn callback(&self, token: u64) -> impl FnOnce(&K) -> Result<(), String> + Send + 'static {
        let callback = Callback {
            link: self.clone(),
            token,
            invoked: false,
        };
        move |id: &K| callback.run(id)
    }

    /// Ask the follower to run `token` and block until it reports back
    ///
    /// Runs on the pacing thread (background) or a hand-off thread
    /// (foreground), never on the runtime.
    fn invoke(&self, token: u64, id: &K) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut callbacks = self.callbacks.lock();
            if !callbacks.connected {
                return Err(DISCONNECTED.to_string());
            }
            callbacks.waiting.insert(token, tx);
        }

        let frame = Frame::Invoke {
            token,
            id: id.clone(),
        };
        if !self.send(frame) {
            self.callbacks.lock().waiting.remove(&token);
            return Err(DISCONNECTED.to_string());
        }

        match rx.blocking_recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(DispatchError::WorkFailed { message })) => Err(message),
            Ok(Err(other)) => Err(other.to_string()),
            Err(_) => Err(DISCONNECTED.to_string()),
        }
    }

    fn resolve(&self, token: u64, outcome: Outcome) {
        match self.callbacks.lock().waiting.remove(&token) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => warn!(token, "Outcome for a callback nobody waits on"),
        }
    }

    /// Fail every waiting callback; later invocations fail immediately
    fn disconnect(&self) {
        let waiting = {
            let mut callbacks = self.callbacks.lock();
            callbacks.connected = false;
            mem::take(&mut callbacks.waiting)
        };
        if !waiting.is_empty() {
            warn!(callbacks = waiting.len(), "Failing callbacks of a disconnected follower");
        }
        for (_, tx) in waiting {
            let _ = tx.send(Err(DispatchError::failed(DISCONNECTED)));
        }
    }
}

/// Stand-in for a follower's callable inside the shared dispatcher
///
/// Dropped without running (duplicate, promotion, shutdown), it tells the
/// follower to forget the callable.
struct Callback<K: SharedKey> {
    link: Link<K>,
    token: u64,
    invoked: bool,
}

impl<K: SharedKey> Callback<K> {
    fn run(mut self, id: &K) -> Result<(), String> {
        self.invoked = true;
        self.link.invoke(self.token, id)
    }
}

impl<K: SharedKey> Drop for Callback<K> {
    fn drop(&mut self) {
        if !self.invoked {
            trace!(token = self.token, "Callback dropped unrun");
            self.link.send(Frame::Discard { token: self.token });
        }
    }
}

/// Serve one follower connection until it closes or the endpoint stops
async fn serve<K: SharedKey>(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher<K>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame_length: usize,
) {
    let (mut sink, mut lines) = Framed::new(stream, codec(max_frame_length)).split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame<K>>();
    let link = Link {
        frames: frames_tx,
        callbacks: Arc::new(Mutex::new(Callbacks {
            connected: true,
            waiting: HashMap::new(),
        })),
    };

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let line = match frame.encode() {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                debug!(error = %e, "Follower write failed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!(peer = %peer, "Closing follower session");
                break;
            }
            next = lines.next() => match next {
                Some(Ok(line)) => match Frame::<K>::decode(&line) {
                    Ok(Frame::Request { seq, call }) => {
                        let dispatcher = dispatcher.clone();
                        let link = link.clone();
                        tokio::task::spawn_blocking(move || {
                            let reply = answer(&dispatcher, &link, call);
                            link.send(Frame::Reply { seq, reply });
                        });
                    }
                    Ok(Frame::Invoked { token, outcome }) => link.resolve(token, outcome),
                    Ok(other) => warn!(peer = %peer, frame = ?other, "Unexpected frame from follower"),
                    Err(e) => warn!(peer = %peer, error = %e, "Dropping malformed frame"),
                },
                Some(Err(e)) => {
                    warn!(peer = %peer, error = %e, "Follower connection failed");
                    break;
                }
                None => {
                    debug!(peer = %peer, "Follower disconnected");
                    break;
                }
            }
        }
    }

    link.disconnect();
    writer.abort();
}

/// Run one follower call against the shared dispatcher
fn answer<K: SharedKey>(dispatcher: &Dispatcher<K>, link: &Link<K>, call: Call<K>) -> Reply {
    match call {
        Call::Background { id, token } => Reply::Submitted {
            accepted: dispatcher.background(id, link.callback(token)),
        },
        Call::Foreground { id, token } => Reply::Completed {
            outcome: dispatcher.foreground(id, link.callback(token)),
        },
        Call::Idle => Reply::Idle {
            idle: dispatcher.idle(),
        },
        Call::Wait { timeout_ms } => Reply::Waited {
            idle: dispatcher.wait(timeout_ms.map(Duration::from_millis)),
        },
        Call::Shutdown => {
            info!("Shutdown requested by follower");
            dispatcher.shutdown();
            Reply::ShutDown
        }
    }
}
