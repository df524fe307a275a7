//! Peer connection actor: one receive task, one send task and one dispatch
//! task per connection, sharing a cancellation token.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::lock;
use crate::message::Message;
use crate::middleware::{Flow, StageList};
use crate::pipe::{Direction, Pipe, PipeError, PipeIo};
use crate::transport::{BoxedReader, BoxedWriter, Connection};
use crate::wire::{self, WireError, DEFAULT_MAX_FRAME_LEN};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local peer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    fn next() -> Self {
        PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("transport: {0}")]
    Transport(#[from] WireError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipeError),
}

impl PeerError {
    /// True when the error means the remote side went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            PeerError::Disconnected => true,
            PeerError::Transport(err) => err.is_disconnect(),
            PeerError::Pipeline(PipeError::Disconnected) => true,
            PeerError::Pipeline(_) => false,
        }
    }
}

/// Notifications from a peer to its owner.
#[derive(Debug)]
pub enum PeerEvent {
    /// An inbound message made it through every stage.
    Delivered { peer: Peer, message: Message },
    /// The remote closed the connection.
    Disconnected { peer: Peer },
    /// Transport or pipeline failure. The peer is cancelled but not stopped.
    Failed { peer: Peer, error: PeerError },
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub queue_capacity: usize,
    pub max_frame_len: u32,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl From<&NetworkConfig> for PeerOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            max_frame_len: config.max_frame_len,
        }
    }
}

/// Per-peer key/value store for stage state (e.g. a remote public key).
#[derive(Default)]
pub struct Metadata {
    values: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Metadata {
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        lock(&self.values).insert(key.into(), Arc::new(value));
    }

    /// Typed lookup; `None` if missing or stored with another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = lock(&self.values).get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        lock(&self.values).contains_key(key)
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = lock(&self.values);
        f.debug_set().entries(values.keys()).finish()
    }
}

/// Connection halves and queue ends waiting for [`Peer::start`].
struct Pending {
    reader: BoxedReader,
    writer: BoxedWriter,
    outbound: mpsc::Receiver<Message>,
    options: PeerOptions,
}

enum Lifecycle {
    Created(Pending),
    Running(Vec<JoinHandle<()>>),
    Stopping,
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> PeerState {
        match self {
            Lifecycle::Created(_) => PeerState::Created,
            Lifecycle::Running(_) => PeerState::Running,
            Lifecycle::Stopping => PeerState::Stopping,
            Lifecycle::Stopped => PeerState::Stopped,
        }
    }
}

struct PeerInner {
    id: PeerId,
    local_addr: String,
    remote_addr: String,
    metadata: Metadata,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    /// Cancelled once teardown has joined every task.
    stopped: CancellationToken,
    /// Set by the first of `stop` or a failure; later failures are silent.
    closing: AtomicBool,
    /// Set when a failure event was emitted.
    failed: AtomicBool,
    events: mpsc::UnboundedSender<PeerEvent>,
}

/// Handle to a connected peer. Cheap to clone; all clones share one actor.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Wrap `connection` in a peer in `Created` state. Nothing runs until
    /// [`start`](Self::start); messages sent before that are queued.
    pub fn new(
        connection: Connection,
        events: mpsc::UnboundedSender<PeerEvent>,
        options: PeerOptions,
    ) -> Peer {
        let (reader, writer, local_addr, remote_addr) = connection.into_parts();
        let (outbound_tx, outbound_rx) = mpsc::channel(options.queue_capacity.max(1));
        let pending = Pending {
            reader,
            writer,
            outbound: outbound_rx,
            options,
        };
        Peer {
            inner: Arc::new(PeerInner {
                id: PeerId::next(),
                local_addr,
                remote_addr,
                metadata: Metadata::default(),
                outbound: outbound_tx,
                cancel: CancellationToken::new(),
                lifecycle: Mutex::new(Lifecycle::Created(pending)),
                stopped: CancellationToken::new(),
                closing: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// [`new`](Self::new) followed by [`start`](Self::start).
    pub fn spawn(
        connection: Connection,
        stages: Arc<StageList>,
        events: mpsc::UnboundedSender<PeerEvent>,
        options: PeerOptions,
    ) -> Peer {
        let peer = Peer::new(connection, events, options);
        peer.start(stages);
        peer
    }

    /// Spawn the receive, send and dispatch tasks. Returns false unless the
    /// peer was in `Created` state.
    pub fn start(&self, stages: Arc<StageList>) -> bool {
        let mut lifecycle = lock(&self.inner.lifecycle);
        let pending = match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
            Lifecycle::Created(pending) => pending,
            other => {
                *lifecycle = other;
                return false;
            }
        };
        let Pending {
            reader,
            writer,
            outbound,
            options,
        } = pending;
        let (inbound_tx, inbound_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (wire_tx, wire_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (read_error_tx, read_error_rx) = oneshot::channel();
        let io = PipeIo::new(inbound_rx, wire_tx, self.inner.cancel.clone());

        let handles = vec![
            tokio::spawn(receive_loop(
                self.clone(),
                reader,
                inbound_tx,
                read_error_tx,
                options.max_frame_len,
            )),
            tokio::spawn(send_loop(
                self.clone(),
                writer,
                wire_rx,
                options.max_frame_len,
            )),
            tokio::spawn(dispatch_loop(
                self.clone(),
                stages,
                io,
                outbound,
                read_error_rx,
            )),
        ];
        *lifecycle = Lifecycle::Running(handles);
        debug!(peer = %self.id(), remote = %self.remote_addr(), "peer started");
        true
    }

    /// Queue `msg` for the Send pipeline.
    pub async fn send(&self, msg: Message) -> Result<(), PeerError> {
        if self.inner.cancel.is_cancelled() {
            return Err(PeerError::Disconnected);
        }
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(PeerError::Disconnected),
            res = self.inner.outbound.send(msg) => res.map_err(|_| PeerError::Disconnected),
        }
    }

    /// Cancel the peer and wait for its tasks to finish.
    ///
    /// Only the first caller tears down and gets `true`; every caller returns
    /// once the peer is `Stopped`. Must not be awaited from inside a stage of
    /// this same peer.
    pub async fn stop(&self) -> bool {
        let handles = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Created(pending) => {
                    drop(pending);
                    Some(Vec::new())
                }
                Lifecycle::Running(handles) => Some(handles),
                other => {
                    *lifecycle = other;
                    None
                }
            }
        };
        let Some(handles) = handles else {
            self.inner.stopped.cancelled().await;
            return false;
        };
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();

        for handle in handles {
            if let Err(err) = handle.await {
                error!(peer = %self.id(), error = %err, "peer task panicked");
            }
        }
        *lock(&self.inner.lifecycle) = Lifecycle::Stopped;
        self.inner.stopped.cancel();
        debug!(peer = %self.id(), remote = %self.remote_addr(), "peer stopped");
        true
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    pub fn state(&self) -> PeerState {
        lock(&self.inner.lifecycle).state()
    }

    /// True once a failure event went out for this peer.
    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Report the first failure: cancel and emit one event. Silent if the
    /// peer is already closing.
    fn fail(&self, error: PeerError) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            trace!(peer = %self.id(), error = %error, "failure after close ignored");
            return;
        }
        self.inner.failed.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
        let event = if error.is_disconnect() {
            info!(peer = %self.id(), remote = %self.remote_addr(), "remote closed connection");
            PeerEvent::Disconnected { peer: self.clone() }
        } else {
            warn!(peer = %self.id(), remote = %self.remote_addr(), error = %error, "peer failed");
            PeerEvent::Failed {
                peer: self.clone(),
                error,
            }
        };
        let _ = self.inner.events.send(event);
    }

    fn deliver(&self, message: Message) {
        let _ = self.inner.events.send(PeerEvent::Delivered {
            peer: self.clone(),
            message,
        });
    }

    #[cfg(test)]
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Peer with no connection or tasks, for driving a pipe by hand.
    #[cfg(test)]
    pub(crate) fn detached(cancel: CancellationToken) -> Peer {
        let (outbound, _) = mpsc::channel(1);
        let (events, _) = mpsc::unbounded_channel();
        let stopped = CancellationToken::new();
        stopped.cancel();
        Peer {
            inner: Arc::new(PeerInner {
                id: PeerId::next(),
                local_addr: "local".into(),
                remote_addr: "remote".into(),
                metadata: Metadata::default(),
                outbound,
                cancel,
                lifecycle: Mutex::new(Lifecycle::Stopped),
                stopped,
                closing: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                events,
            }),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local_addr)
            .field("remote", &self.inner.remote_addr)
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.inner.id, self.inner.remote_addr)
    }
}

async fn receive_loop(
    peer: Peer,
    mut reader: BoxedReader,
    inbound: mpsc::Sender<Message>,
    read_error: oneshot::Sender<WireError>,
    max_frame_len: u32,
) {
    let cancel = peer.inner.cancel.clone();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = wire::read_frame(&mut reader, max_frame_len) => frame,
        };
        match frame {
            Ok(payload) => {
                trace!(peer = %peer.id(), len = payload.len(), "frame received");
                let forwarded = tokio::select! {
                    _ = cancel.cancelled() => false,
                    res = inbound.send(Message::from_payload(payload)) => res.is_ok(),
                };
                if !forwarded {
                    break;
                }
            }
            Err(err) => {
                // Reported by dispatch once it has drained the frames already queued.
                trace!(peer = %peer.id(), error = %err, "read failed");
                let _ = read_error.send(err);
                break;
            }
        }
    }
    trace!(peer = %peer.id(), "receive task finished");
}

async fn send_loop(
    peer: Peer,
    mut writer: BoxedWriter,
    mut wire_rx: mpsc::Receiver<Message>,
    max_frame_len: u32,
) {
    let cancel = peer.inner.cancel.clone();
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = wire_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            res = wire::write_frame(&mut writer, msg.payload(), max_frame_len) => res,
        };
        match written {
            Ok(()) => trace!(peer = %peer.id(), len = msg.payload().len(), "frame sent"),
            Err(err) => {
                peer.fail(err.into());
                break;
            }
        }
    }
    if let Err(err) = writer.shutdown().await {
        trace!(peer = %peer.id(), error = %err, "writer shutdown");
    }
    trace!(peer = %peer.id(), "send task finished");
}

async fn dispatch_loop(
    peer: Peer,
    stages: Arc<StageList>,
    mut io: PipeIo,
    mut outbound: mpsc::Receiver<Message>,
    mut read_error: oneshot::Receiver<WireError>,
) {
    let cancel = peer.inner.cancel.clone();
    loop {
        let (direction, mut msg) = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = io.inbound.recv() => match msg {
                Some(msg) => (Direction::Receive, msg),
                None => {
                    if let Ok(err) = read_error.try_recv() {
                        peer.fail(err.into());
                    }
                    break;
                }
            },
            msg = outbound.recv() => match msg {
                Some(msg) => (Direction::Send, msg),
                None => break,
            },
        };
        let result = Pipe::full(&peer, &stages, &mut io, direction)
            .process(&mut msg)
            .await;
        match (result, direction) {
            (Ok(Flow::Continue), Direction::Receive) => peer.deliver(msg),
            (Ok(Flow::Continue), Direction::Send) => {
                if let Err(err) = io.write(msg).await {
                    peer.fail(err.into());
                    break;
                }
            }
            (Ok(Flow::Halt), _) => {
                trace!(peer = %peer.id(), direction = %direction, "message halted")
            }
            (Err(err), _) => {
                peer.fail(pipeline_failure(err, &mut read_error));
                break;
            }
        }
    }
    trace!(peer = %peer.id(), "dispatch task finished");
}

/// A stage that hit the end of the inbound stream fails with the read error
/// that ended it.
fn pipeline_failure(err: PipeError, read_error: &mut oneshot::Receiver<WireError>) -> PeerError {
    match (err, read_error.try_recv()) {
        (PipeError::Disconnected, Ok(wire)) => wire.into(),
        (err, _) => err.into(),
    }
}
