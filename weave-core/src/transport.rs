//! Transport plug-ins: a [`Connection`] is any byte stream split in two halves,
//! an [`Operator`] dials and accepts them for one network kind.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where operators push accepted connections.
pub type ConnectionSink = mpsc::UnboundedSender<Connection>;

pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
    local_addr: String,
    remote_addr: String,
}

impl Connection {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }

    /// Split a bidirectional stream (e.g. `tokio::io::duplex`) into a connection.
    pub fn from_stream<S>(
        stream: S,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, local_addr, remote_addr)
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter, String, String) {
        (self.reader, self.writer, self.local_addr, self.remote_addr)
    }
}

impl TryFrom<TcpStream> for Connection {
    type Error = io::Error;

    fn try_from(stream: TcpStream) -> Result<Self, Self::Error> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, local.to_string(), remote.to_string()))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The operator does not serve this network kind.
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
    #[error("operator not started")]
    NotStarted,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Dials and accepts connections for one network kind (e.g. `"tcp"`).
#[async_trait]
pub trait Operator: Send + Sync {
    fn network(&self) -> &str;

    /// Start accepting in the background, pushing each connection into `sink`.
    async fn start(&self, sink: ConnectionSink) -> Result<(), TransportError>;

    async fn dial(&self, network: &str, addr: &str) -> Result<Connection, TransportError>;

    async fn stop(&self);
}

pub const TCP: &str = "tcp";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpOperator {
    listen_addr: String,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpOperator {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            local_addr: Mutex::new(None),
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
        }
    }

    /// Bound address, available once started (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        (*lock(&self.local_addr)).ok_or(TransportError::NotStarted)
    }
}

#[async_trait]
impl Operator for TcpOperator {
    fn network(&self) -> &str {
        TCP
    }

    async fn start(&self, sink: ConnectionSink) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local = listener.local_addr()?;
        *lock(&self.local_addr) = Some(local);
        info!(addr = %local, "tcp listening");
        let handle = tokio::spawn(accept_loop(listener, sink, self.cancel.clone()));
        *lock(&self.accept_task) = Some(handle);
        Ok(())
    }

    async fn dial(&self, network: &str, addr: &str) -> Result<Connection, TransportError> {
        if network != TCP {
            return Err(TransportError::InvalidNetwork(network.to_string()));
        }
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let conn = Connection::try_from(stream)?;
        debug!(local = conn.local_addr(), remote = conn.remote_addr(), "tcp dialed");
        Ok(conn)
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let handle = lock(&self.accept_task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(listener: TcpListener, sink: ConnectionSink, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                match Connection::try_from(stream) {
                    Ok(conn) => {
                        debug!(remote = %addr, "tcp accepted");
                        if sink.send(conn).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(remote = %addr, error = %e, "dropping accepted connection"),
                }
            }
            Err(e) => {
                warn!(error = %e, "tcp accept failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    debug!("tcp accept loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{self, DEFAULT_MAX_FRAME_LEN};

    #[tokio::test]
    async fn dial_and_accept() {
        let op = TcpOperator::new("127.0.0.1:0");
        assert!(matches!(op.local_addr(), Err(TransportError::NotStarted)));
        let (sink, mut accepted) = mpsc::unbounded_channel();
        op.start(sink).await.unwrap();
        let addr = op.local_addr().unwrap();

        let dialed = op.dial(TCP, &addr.to_string()).await.unwrap();
        assert_eq!(dialed.remote_addr(), addr.to_string());
        let incoming = accepted.recv().await.unwrap();
        assert_eq!(incoming.remote_addr(), dialed.local_addr());

        let (_, mut writer, _, _) = dialed.into_parts();
        let (mut reader, _, _, _) = incoming.into_parts();
        wire::write_frame(&mut writer, b"over tcp", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        let frame = wire::read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert_eq!(frame, b"over tcp");
        op.stop().await;
    }

    #[tokio::test]
    async fn wrong_network_is_rejected() {
        let op = TcpOperator::new("127.0.0.1:0");
        let err = op.dial("udp", "127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidNetwork(n) if n == "udp"));
    }
}
