//! Weave: a small peer-to-peer networking stack.
//!
//! Connections are framed byte streams. Every message a peer sends or
//! receives runs through an ordered list of middleware stages (annotation
//! headers, RSA/AES handshake and encryption, logging, routing). A
//! [`Network`] ties transports, peers and the bounded peer store together
//! and publishes [`NetworkEvent`]s.

pub mod config;
pub mod identity;
pub mod message;
pub mod middleware;
pub mod network;
pub mod peer;
pub mod peer_store;
pub mod pipe;
pub mod stages;
pub mod transport;
pub mod wire;

pub use config::NetworkConfig;
pub use identity::{CryptoError, Keypair, PublicKey};
pub use message::{Annotations, Message, MessageId};
pub use middleware::{Flow, Middleware, Stage, StageList, StageListBuilder};
pub use network::{Network, NetworkBuilder, NetworkError, NetworkEvent};
pub use peer::{Peer, PeerError, PeerEvent, PeerId, PeerOptions, PeerState};
pub use peer_store::{PeerStore, StoreEvent};
pub use pipe::{BoxError, Direction, Pipe, PipeError};
pub use transport::{Connection, Operator, TcpOperator, TransportError};
pub use wire::{decode_frame, encode_frame, WireError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
