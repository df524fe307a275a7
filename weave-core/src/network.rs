//! Network façade: owns the stage list, operators, peer store and event pump.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::identity::Keypair;
use crate::lock;
use crate::message::Message;
use crate::middleware::{Middleware, StageList, StageListBuilder};
use crate::peer::{Peer, PeerError, PeerEvent, PeerOptions};
use crate::peer_store::{PeerStore, StoreEvent};
use crate::stages::{Crypt, Headers, Log, Routes, RoutingTable};
use crate::transport::{Connection, Operator, TcpOperator, TransportError};

/// What subscribers see.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerConnected(Peer),
    Message { peer: Peer, message: Message },
    PeerError { peer: Peer, error: Arc<PeerError> },
    PeerDisconnected(Peer),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network not started")]
    NotStarted,
    #[error("network already started")]
    AlreadyStarted,
    #[error("no peer with address {0}")]
    PeerNotFound(String),
    #[error("no operator for network {0}")]
    NoOperator(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("peer: {0}")]
    Peer(#[from] PeerError),
}

#[derive(Default)]
pub struct NetworkBuilder {
    stages: StageListBuilder,
    operators: Vec<Arc<dyn Operator>>,
    config: NetworkConfig,
}

impl NetworkBuilder {
    /// Append a stage. Positions follow call order.
    pub fn middleware(mut self, name: impl Into<String>, middleware: impl Middleware + 'static) -> Self {
        self.stages = self.stages.stage(name, middleware);
        self
    }

    pub fn operator(self, operator: impl Operator + 'static) -> Self {
        self.operator_arc(Arc::new(operator))
    }

    /// Register a shared operator, e.g. to read its bound address later.
    pub fn operator_arc(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operators.push(operator);
        self
    }

    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Network {
        let (store, store_events) = PeerStore::new(self.config.peer_capacity);
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let stages = self.stages.build();
        debug!(
            stages = stages.len(),
            operators = self.operators.len(),
            "network built"
        );
        Network {
            inner: Arc::new(NetworkInner {
                stages: Arc::new(stages),
                operators: self.operators,
                store,
                config: self.config,
                events,
                peer_events: peer_events_tx,
                runtime: Mutex::new(Runtime {
                    state: RunState::Idle,
                    receivers: Some((peer_events_rx, store_events)),
                    cancel: CancellationToken::new(),
                    pump: None,
                }),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

type Receivers = (
    mpsc::UnboundedReceiver<PeerEvent>,
    mpsc::UnboundedReceiver<StoreEvent>,
);

struct Runtime {
    state: RunState,
    receivers: Option<Receivers>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

struct NetworkInner {
    stages: Arc<StageList>,
    operators: Vec<Arc<dyn Operator>>,
    store: Arc<PeerStore>,
    config: NetworkConfig,
    events: broadcast::Sender<NetworkEvent>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    runtime: Mutex<Runtime>,
}

/// Handle to a network. Cheap to clone.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::default()
    }

    /// TCP network with stages routes, headers, crypt, log.
    pub fn tcp(listen_addr: impl Into<String>, routes: RoutingTable, keypair: Keypair) -> Network {
        Network::tcp_builder(listen_addr, routes, keypair).build()
    }

    /// Same stack as [`tcp`](Self::tcp), left open for config or more operators.
    pub fn tcp_builder(
        listen_addr: impl Into<String>,
        routes: RoutingTable,
        keypair: Keypair,
    ) -> NetworkBuilder {
        Network::builder()
            .middleware("routes", Routes::new(routes))
            .middleware("headers", Headers)
            .middleware("crypt", Crypt::with_keypair(keypair))
            .middleware("log", Log)
            .operator(TcpOperator::new(listen_addr))
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.store.peers()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.runtime).state == RunState::Running
    }

    fn ensure_running(&self) -> Result<(), NetworkError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NetworkError::NotStarted)
        }
    }

    /// Start operators, the store sweep and the event pump. A network runs once.
    pub async fn start(&self) -> Result<(), NetworkError> {
        let (peer_events, store_events, cancel) = {
            let mut rt = lock(&self.inner.runtime);
            if rt.state != RunState::Idle {
                return Err(NetworkError::AlreadyStarted);
            }
            let (peer_events, store_events) =
                rt.receivers.take().ok_or(NetworkError::AlreadyStarted)?;
            rt.state = RunState::Running;
            (peer_events, store_events, rt.cancel.clone())
        };

        let (sink, connections) = mpsc::unbounded_channel();
        for operator in &self.inner.operators {
            if let Err(err) = operator.start(sink.clone()).await {
                warn!(network = operator.network(), error = %err, "operator failed to start");
                for started in &self.inner.operators {
                    started.stop().await;
                }
                lock(&self.inner.runtime).state = RunState::Stopped;
                return Err(err.into());
            }
        }
        self.inner.store.start(self.inner.config.eviction_interval());

        let pump = tokio::spawn(run_event_pump(
            self.clone(),
            connections,
            peer_events,
            store_events,
            cancel,
        ));
        lock(&self.inner.runtime).pump = Some(pump);
        info!(operators = self.inner.operators.len(), "network started");
        Ok(())
    }

    /// Stop operators and every peer, then the sweep and the pump.
    pub async fn stop(&self) -> Result<(), NetworkError> {
        {
            let mut rt = lock(&self.inner.runtime);
            if rt.state != RunState::Running {
                return Err(NetworkError::NotStarted);
            }
            rt.state = RunState::Stopped;
        }
        for operator in &self.inner.operators {
            operator.stop().await;
        }
        for peer in self.inner.store.peers() {
            peer.stop().await;
            self.inner.store.remove(&peer);
        }
        self.inner.store.stop().await;

        let pump = {
            let mut rt = lock(&self.inner.runtime);
            rt.cancel.cancel();
            rt.pump.take()
        };
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        info!("network stopped");
        Ok(())
    }

    /// Dial `addr` through the operators serving `network` and admit the peer.
    pub async fn connect_to(&self, network: &str, addr: &str) -> Result<Peer, NetworkError> {
        self.ensure_running()?;
        for operator in &self.inner.operators {
            match operator.dial(network, addr).await {
                Ok(conn) => return Ok(self.admit(conn)),
                Err(TransportError::InvalidNetwork(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(NetworkError::NoOperator(network.to_string()))
    }

    /// Queue `msg` for the peer whose remote address is `addr`.
    pub async fn send(&self, msg: Message, addr: &str) -> Result<(), NetworkError> {
        self.ensure_running()?;
        let peer = self
            .inner
            .store
            .find_by_address(addr)
            .ok_or_else(|| NetworkError::PeerNotFound(addr.to_string()))?;
        peer.send(msg).await?;
        Ok(())
    }

    /// Queue a copy of `msg` on every peer. Returns how many accepted it.
    pub async fn broadcast(&self, msg: Message) -> Result<usize, NetworkError> {
        self.ensure_running()?;
        let mut queued = 0;
        for peer in self.inner.store.peers() {
            match peer.send(msg.clone()).await {
                Ok(()) => queued += 1,
                Err(err) => debug!(peer = %peer.id(), error = %err, "broadcast skipped peer"),
            }
        }
        Ok(queued)
    }

    pub async fn disconnect(&self, addr: &str) -> Result<(), NetworkError> {
        self.ensure_running()?;
        let peer = self
            .inner
            .store
            .find_by_address(addr)
            .ok_or_else(|| NetworkError::PeerNotFound(addr.to_string()))?;
        let stopped = peer.stop().await;
        self.inner.store.remove(&peer);
        if stopped && !peer.has_failed() {
            info!(peer = %peer.id(), remote = peer.remote_addr(), "peer disconnected");
            let _ = self.inner.events.send(NetworkEvent::PeerDisconnected(peer));
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    pub fn on_peer_connected<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Peer) + Send + 'static,
    {
        self.listen(move |event| {
            if let NetworkEvent::PeerConnected(peer) = event {
                handler(peer);
            }
        })
    }

    pub fn on_message<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Peer, Message) + Send + 'static,
    {
        self.listen(move |event| {
            if let NetworkEvent::Message { peer, message } = event {
                handler(peer, message);
            }
        })
    }

    pub fn on_peer_error<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Peer, Arc<PeerError>) + Send + 'static,
    {
        self.listen(move |event| {
            if let NetworkEvent::PeerError { peer, error } = event {
                handler(peer, error);
            }
        })
    }

    pub fn on_peer_disconnected<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(Peer) + Send + 'static,
    {
        self.listen(move |event| {
            if let NetworkEvent::PeerDisconnected(peer) = event {
                handler(peer);
            }
        })
    }

    fn listen<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(NetworkEvent) + Send + 'static,
    {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => handler(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Register a connection as a peer, announce it, then start it so its
    /// messages never precede the announcement.
    fn admit(&self, conn: Connection) -> Peer {
        let peer = Peer::new(
            conn,
            self.inner.peer_events.clone(),
            PeerOptions::from(&self.inner.config),
        );
        self.inner.store.add(peer.clone());
        info!(peer = %peer.id(), remote = peer.remote_addr(), "peer connected");
        let _ = self.inner.events.send(NetworkEvent::PeerConnected(peer.clone()));
        peer.start(self.inner.stages.clone());
        peer
    }

    fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Delivered { peer, message } => {
                let _ = self.inner.events.send(NetworkEvent::Message { peer, message });
            }
            PeerEvent::Disconnected { peer } => self.teardown(peer, None),
            PeerEvent::Failed { peer, error } => self.teardown(peer, Some(error)),
        }
    }

    /// Stop, then remove, then emit. Runs on its own task so the pump never
    /// waits on a peer.
    fn teardown(&self, peer: Peer, error: Option<PeerError>) {
        let store = self.inner.store.clone();
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            peer.stop().await;
            store.remove(&peer);
            let event = match error {
                Some(error) => NetworkEvent::PeerError {
                    peer,
                    error: Arc::new(error),
                },
                None => NetworkEvent::PeerDisconnected(peer),
            };
            let _ = events.send(event);
        });
    }

    fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::ShouldRemove(peer) => {
                let store = self.inner.store.clone();
                let events = self.inner.events.clone();
                tokio::spawn(async move {
                    let stopped = peer.stop().await;
                    store.remove(&peer);
                    // A failed peer is already reported by `teardown`.
                    if stopped && !peer.has_failed() {
                        info!(peer = %peer.id(), remote = peer.remote_addr(), "peer evicted");
                        let _ = events.send(NetworkEvent::PeerDisconnected(peer));
                    }
                });
            }
        }
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("stages", &self.inner.stages)
            .field("operators", &self.inner.operators.len())
            .field("peers", &self.inner.store.len())
            .finish()
    }
}

async fn run_event_pump(
    network: Network,
    mut connections: mpsc::UnboundedReceiver<Connection>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    mut store_events: mpsc::UnboundedReceiver<StoreEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(conn) = connections.recv() => {
                network.admit(conn);
            }
            Some(event) = peer_events.recv() => network.handle_peer_event(event),
            Some(event) = store_events.recv() => network.handle_store_event(event),
        }
    }
    debug!("event pump finished");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::peer::PeerState;
    use crate::transport::ConnectionSink;

    const WAIT: Duration = Duration::from_secs(5);

    /// Operator over in-memory duplex pipes. Dialing hands the other end to
    /// the sink of the operator registered at that address.
    #[derive(Default)]
    struct MemoryOperator {
        addr: String,
        sink: Mutex<Option<ConnectionSink>>,
        routes: Arc<Mutex<Vec<(String, ConnectionSink)>>>,
    }

    impl MemoryOperator {
        fn pair(a: &str, b: &str) -> (MemoryOperator, MemoryOperator) {
            let routes = Arc::new(Mutex::new(Vec::new()));
            let make = |addr: &str| MemoryOperator {
                addr: addr.to_string(),
                sink: Mutex::new(None),
                routes: routes.clone(),
            };
            (make(a), make(b))
        }
    }

    #[async_trait]
    impl Operator for MemoryOperator {
        fn network(&self) -> &str {
            "mem"
        }

        async fn start(&self, sink: ConnectionSink) -> Result<(), TransportError> {
            self.routes.lock().unwrap().push((self.addr.clone(), sink.clone()));
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn dial(&self, network: &str, addr: &str) -> Result<Connection, TransportError> {
            if network != "mem" {
                return Err(TransportError::InvalidNetwork(network.to_string()));
            }
            let sink = self
                .routes
                .lock()
                .unwrap()
                .iter()
                .find(|(a, _)| a == addr)
                .map(|(_, s)| s.clone())
                .ok_or(TransportError::NotStarted)?;
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let _ = sink.send(Connection::from_stream(theirs, addr, self.addr.clone()));
            Ok(Connection::from_stream(ours, self.addr.clone(), addr))
        }

        async fn stop(&self) {
            self.sink.lock().unwrap().take();
        }
    }

    fn plain_network(op: MemoryOperator, config: NetworkConfig) -> Network {
        Network::builder()
            .middleware("headers", Headers)
            .operator(op)
            .config(config)
            .build()
    }

    async fn next_event(rx: &mut broadcast::Receiver<NetworkEvent>) -> NetworkEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn operations_require_start() {
        let (op, _) = MemoryOperator::pair("a", "b");
        let net = plain_network(op, NetworkConfig::default());
        assert!(matches!(
            net.send(Message::from("x"), "b").await,
            Err(NetworkError::NotStarted)
        ));
        assert!(matches!(net.stop().await, Err(NetworkError::NotStarted)));
        net.start().await.unwrap();
        assert!(matches!(net.start().await, Err(NetworkError::AlreadyStarted)));
        assert!(matches!(
            net.send(Message::from("x"), "nobody").await,
            Err(NetworkError::PeerNotFound(_))
        ));
        assert!(matches!(
            net.connect_to("tcp", "b").await,
            Err(NetworkError::NoOperator(_))
        ));
        net.stop().await.unwrap();
        assert!(matches!(net.start().await, Err(NetworkError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn connect_send_and_disconnect() {
        let (op_a, op_b) = MemoryOperator::pair("a", "b");
        let a = plain_network(op_a, NetworkConfig::default());
        let b = plain_network(op_b, NetworkConfig::default());
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let peer = a.connect_to("mem", "b").await.unwrap();
        assert_eq!(peer.remote_addr(), "b");
        assert!(matches!(next_event(&mut a_events).await, NetworkEvent::PeerConnected(p) if p == peer));
        assert!(matches!(next_event(&mut b_events).await, NetworkEvent::PeerConnected(_)));

        a.send(Message::from("hi").with_annotation("k", "v"), "b")
            .await
            .unwrap();
        match next_event(&mut b_events).await {
            NetworkEvent::Message { peer, message } => {
                assert_eq!(peer.remote_addr(), "a");
                assert_eq!(message.payload(), b"hi");
                assert_eq!(message.annotations().get("k").map(String::as_str), Some("v"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(b.broadcast(Message::from("to all")).await.unwrap(), 1);
        match next_event(&mut a_events).await {
            NetworkEvent::Message { message, .. } => assert_eq!(message.payload(), b"to all"),
            other => panic!("unexpected {other:?}"),
        }

        a.disconnect("b").await.unwrap();
        assert!(matches!(next_event(&mut a_events).await, NetworkEvent::PeerDisconnected(p) if p == peer));
        assert!(a.peers().is_empty());
        assert!(matches!(next_event(&mut b_events).await, NetworkEvent::PeerDisconnected(_)));
        assert!(b.peers().is_empty());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn over_capacity_evicts_oldest() {
        let (op_a, op_b) = MemoryOperator::pair("a", "b");
        let config = NetworkConfig {
            peer_capacity: 1,
            eviction_interval_secs: 1,
            ..NetworkConfig::default()
        };
        let a = plain_network(op_a, config);
        let b = plain_network(op_b, NetworkConfig::default());
        a.start().await.unwrap();
        b.start().await.unwrap();
        let mut a_events = a.subscribe();

        let first = a.connect_to("mem", "b").await.unwrap();
        let second = a.connect_to("mem", "b").await.unwrap();
        assert_eq!(a.peers().len(), 2);

        loop {
            match next_event(&mut a_events).await {
                NetworkEvent::PeerDisconnected(p) => {
                    assert_eq!(p, first);
                    break;
                }
                NetworkEvent::PeerConnected(_) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(a.peers(), vec![second]);
        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn eviction_of_failed_peer_is_silent() {
        let (op, _) = MemoryOperator::pair("a", "b");
        let net = plain_network(op, NetworkConfig::default());
        let mut rx = net.subscribe();
        let (local, remote) = tokio::io::duplex(1024);
        let peer = net.admit(Connection::from_stream(local, "a", "b"));
        assert!(matches!(next_event(&mut rx).await, NetworkEvent::PeerConnected(_)));

        drop(remote);
        timeout(WAIT, async {
            while !peer.has_failed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        net.handle_store_event(StoreEvent::ShouldRemove(peer.clone()));
        timeout(WAIT, async {
            while !net.peers().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        assert_eq!(peer.state(), PeerState::Stopped);
    }

    #[tokio::test]
    async fn handlers_receive_matching_events() {
        let (op_a, op_b) = MemoryOperator::pair("a", "b");
        let a = plain_network(op_a, NetworkConfig::default());
        let b = plain_network(op_b, NetworkConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connected = tx.clone();
        b.on_peer_connected(move |peer| {
            let _ = connected.send(format!("connected {}", peer.remote_addr()));
        });
        b.on_message(move |_, msg| {
            let _ = tx.send(format!("message {}", msg.payload_string()));
        });
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.connect_to("mem", "b").await.unwrap();
        a.send(Message::from("yo"), "b").await.unwrap();
        // Each handler runs on its own listener task, so arrival order is free.
        let mut seen = vec![
            timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
            timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec!["connected a", "message yo"]);
        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
