//! Key exchange plus per-message hybrid encryption.
//!
//! The first Send on a peer with no known key runs the active handshake:
//! announce our key, wait for the remote announcement, then encrypt. The
//! passive side sees an announcement as its first inbound message, stores
//! the key, answers with its own, and halts the announcement.

use async_trait::async_trait;
use tracing::debug;

use crate::identity::{self, CryptoError, Keypair, PublicKey};
use crate::message::Message;
use crate::middleware::{Flow, Middleware};
use crate::peer::Peer;
use crate::pipe::{Direction, Pipe, PipeError};

/// Peer metadata key holding the remote [`PublicKey`].
pub const PUBLIC_KEY_METADATA: &str = "middleware.crypt.pubkey";

const HANDSHAKE_PREFIX: &[u8] = b"hello:";

#[derive(Debug)]
pub struct Crypt {
    keypair: Keypair,
}

impl Crypt {
    /// Stage with a fresh 2048-bit keypair.
    pub fn new() -> Result<Self, CryptoError> {
        Ok(Self::with_keypair(Keypair::generate()?))
    }

    pub fn with_keypair(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    fn announcement(&self) -> Message {
        let der = self.public_key().as_der();
        let mut payload = Vec::with_capacity(HANDSHAKE_PREFIX.len() + der.len());
        payload.extend_from_slice(HANDSHAKE_PREFIX);
        payload.extend_from_slice(der);
        Message::from_payload(payload)
    }
}

fn parse_announcement(peer: &Peer, payload: &[u8]) -> Result<PublicKey, CryptError> {
    let der = payload
        .strip_prefix(HANDSHAKE_PREFIX)
        .ok_or_else(|| CryptError::InvalidHandshake {
            remote: peer.remote_addr().to_string(),
        })?;
    Ok(PublicKey::from_der(der)?)
}

#[async_trait]
impl Middleware for Crypt {
    async fn execute(
        &self,
        peer: &Peer,
        pipe: &mut Pipe<'_>,
        msg: &mut Message,
    ) -> Result<Flow, PipeError> {
        if let Some(remote) = peer.metadata().get::<PublicKey>(PUBLIC_KEY_METADATA) {
            let payload = match pipe.direction() {
                Direction::Send => identity::seal(&remote, msg.payload()),
                Direction::Receive => self.keypair.open(msg.payload()),
            }
            .map_err(CryptError::from)?;
            msg.set_payload(payload);
            return Ok(Flow::Continue);
        }

        match pipe.direction() {
            Direction::Receive => {
                let remote = parse_announcement(peer, msg.payload())?;
                debug!(peer = %peer.id(), "handshake: received announcement, answering");
                peer.metadata().insert(PUBLIC_KEY_METADATA, remote);
                pipe.send(self.announcement()).await?;
                Ok(Flow::Halt)
            }
            Direction::Send => {
                debug!(peer = %peer.id(), "handshake: announcing");
                pipe.send(self.announcement()).await?;
                let reply = pipe.receive().await?;
                let remote = parse_announcement(peer, reply.payload())?;
                let sealed = identity::seal(&remote, msg.payload()).map_err(CryptError::from)?;
                msg.set_payload(sealed);
                peer.metadata().insert(PUBLIC_KEY_METADATA, remote);
                debug!(peer = %peer.id(), "handshake complete");
                Ok(Flow::Continue)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("invalid handshake message from {remote}")]
    InvalidHandshake { remote: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<CryptError> for PipeError {
    fn from(err: CryptError) -> Self {
        PipeError::stage(err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::middleware::StageList;
    use crate::peer::{PeerEvent, PeerOptions};
    use crate::transport::Connection;
    use crate::wire::{self, DEFAULT_MAX_FRAME_LEN};

    const WAIT: Duration = Duration::from_secs(10);

    fn crypt_peer(keypair: Keypair) -> (Peer, DuplexStream, mpsc::UnboundedReceiver<PeerEvent>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stages = StageList::builder()
            .stage("crypt", Crypt::with_keypair(keypair))
            .build();
        let peer = Peer::spawn(
            Connection::from_stream(local, "local", "remote"),
            Arc::new(stages),
            events_tx,
            PeerOptions::default(),
        );
        (peer, remote, events_rx)
    }

    fn announce(kp: &Keypair) -> Vec<u8> {
        [HANDSHAKE_PREFIX, kp.public_key().as_der()].concat()
    }

    async fn read(remote: &mut DuplexStream) -> Vec<u8> {
        timeout(WAIT, wire::read_frame(remote, DEFAULT_MAX_FRAME_LEN))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn passive_handshake_then_decrypt() {
        let local_kp = Keypair::generate_with_bits(1024).unwrap();
        let local_pub = local_kp.public_key().clone();
        let remote_kp = Keypair::generate_with_bits(1024).unwrap();
        let (peer, mut remote, mut events) = crypt_peer(local_kp);

        wire::write_frame(&mut remote, &announce(&remote_kp), DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        let answer = read(&mut remote).await;
        assert_eq!(answer, [HANDSHAKE_PREFIX, local_pub.as_der()].concat());
        assert!(peer.metadata().contains_key(PUBLIC_KEY_METADATA));

        let sealed = identity::seal(&local_pub, b"secret").unwrap();
        wire::write_frame(&mut remote, &sealed, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            PeerEvent::Delivered { message, .. } => assert_eq!(message.payload(), b"secret"),
            other => panic!("unexpected event {other:?}"),
        }

        peer.send(Message::from("reply")).await.unwrap();
        let frame = read(&mut remote).await;
        assert_eq!(remote_kp.open(&frame).unwrap(), b"reply");
        peer.stop().await;
    }

    #[tokio::test]
    async fn active_handshake_then_encrypt() {
        let local_kp = Keypair::generate_with_bits(1024).unwrap();
        let local_pub = local_kp.public_key().clone();
        let remote_kp = Keypair::generate_with_bits(1024).unwrap();
        let (peer, mut remote, _events) = crypt_peer(local_kp);

        peer.send(Message::from("first")).await.unwrap();
        let hello = read(&mut remote).await;
        assert_eq!(PublicKey::from_der(&hello[HANDSHAKE_PREFIX.len()..]).unwrap(), local_pub);

        wire::write_frame(&mut remote, &announce(&remote_kp), DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        let sealed = read(&mut remote).await;
        assert!(!sealed.windows(5).any(|w| w == b"first"));
        assert_eq!(remote_kp.open(&sealed).unwrap(), b"first");
        peer.stop().await;
    }

    #[tokio::test]
    async fn bad_announcement_fails_peer() {
        let (peer, mut remote, mut events) =
            crypt_peer(Keypair::generate_with_bits(1024).unwrap());
        wire::write_frame(&mut remote, b"bonjour:xyz", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            PeerEvent::Failed { error, .. } => assert!(!error.is_disconnect()),
            other => panic!("unexpected event {other:?}"),
        }
        peer.stop().await;
    }
}
