//! Bounded registry of live peers with periodic capacity eviction.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::lock;
use crate::peer::Peer;

/// Requests from the store to its owner. The store never stops a peer itself.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ShouldRemove(Peer),
}

pub struct PeerStore {
    peers: Mutex<Vec<Peer>>,
    capacity: usize,
    notify: mpsc::UnboundedSender<StoreEvent>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PeerStore {
    pub fn new(capacity: usize) -> (Arc<PeerStore>, mpsc::UnboundedReceiver<StoreEvent>) {
        let (notify, events) = mpsc::unbounded_channel();
        let store = PeerStore {
            peers: Mutex::new(Vec::new()),
            capacity,
            notify,
            sweeper: Mutex::new(None),
        };
        (Arc::new(store), events)
    }

    pub fn add(&self, peer: Peer) {
        let mut peers = lock(&self.peers);
        peers.push(peer);
        trace!(len = peers.len(), capacity = self.capacity, "peer added to store");
    }

    /// Remove by id. Returns false if the peer was not present.
    pub fn remove(&self, peer: &Peer) -> bool {
        let mut peers = lock(&self.peers);
        match peers.iter().position(|p| p.id() == peer.id()) {
            Some(idx) => {
                peers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the current peers, in insertion order.
    pub fn peers(&self) -> Vec<Peer> {
        lock(&self.peers).clone()
    }

    pub fn find_by_address(&self, addr: &str) -> Option<Peer> {
        lock(&self.peers)
            .iter()
            .find(|p| p.remote_addr() == addr)
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.peers).is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// If over capacity, ask the owner to remove the oldest peer and return it.
    pub fn sweep(&self) -> Option<Peer> {
        let candidate = {
            let peers = lock(&self.peers);
            if peers.len() <= self.capacity {
                return None;
            }
            peers.first().cloned()
        }?;
        info!(
            peer = %candidate.id(),
            remote = candidate.remote_addr(),
            capacity = self.capacity,
            "peer store over capacity, evicting"
        );
        let _ = self.notify.send(StoreEvent::ShouldRemove(candidate.clone()));
        Some(candidate)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until [`stop`](Self::stop).
    /// Does nothing if already running.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut sweeper = lock(&self.sweeper);
        if sweeper.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(Arc::downgrade(self), interval, cancel.clone()));
        *sweeper = Some((cancel, handle));
        debug!(interval_ms = interval.as_millis() as u64, "peer store sweep started");
    }

    pub async fn stop(&self) {
        let sweeper = lock(&self.sweeper).take();
        if let Some((cancel, handle)) = sweeper {
            cancel.cancel();
            let _ = handle.await;
            debug!("peer store sweep stopped");
        }
    }
}

async fn sweep_loop(store: Weak<PeerStore>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerOptions;
    use crate::transport::Connection;

    fn idle_peer(remote: &str) -> Peer {
        let (local, _remote) = tokio::io::duplex(64);
        let (events, _) = mpsc::unbounded_channel();
        Peer::new(
            Connection::from_stream(local, "local", remote),
            events,
            PeerOptions::default(),
        )
    }

    #[test]
    fn add_find_remove() {
        let (store, _events) = PeerStore::new(10);
        let a = idle_peer("10.0.0.1:1");
        let b = idle_peer("10.0.0.2:1");
        store.add(a.clone());
        store.add(b.clone());
        assert_eq!(store.len(), 2);
        assert_eq!(store.find_by_address("10.0.0.2:1"), Some(b.clone()));
        assert!(store.find_by_address("10.0.0.3:1").is_none());

        assert!(store.remove(&a));
        assert!(!store.remove(&a));
        assert_eq!(store.peers(), vec![b]);
    }

    #[test]
    fn sweep_within_capacity_is_noop() {
        let (store, mut events) = PeerStore::new(2);
        store.add(idle_peer("a"));
        store.add(idle_peer("b"));
        assert!(store.sweep().is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn sweep_evicts_oldest_without_removing() {
        let (store, mut events) = PeerStore::new(2);
        let oldest = idle_peer("a");
        store.add(oldest.clone());
        store.add(idle_peer("b"));
        store.add(idle_peer("c"));

        assert_eq!(store.sweep(), Some(oldest.clone()));
        match events.try_recv() {
            Ok(StoreEvent::ShouldRemove(peer)) => assert_eq!(peer, oldest),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_fires_on_interval() {
        let (store, mut events) = PeerStore::new(0);
        let peer = idle_peer("a");
        store.add(peer.clone());
        store.start(Duration::from_secs(10));

        let event = events.recv().await.unwrap();
        assert!(matches!(event, StoreEvent::ShouldRemove(p) if p == peer));
        store.stop().await;
    }
}
