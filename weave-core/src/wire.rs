//! Framing: length-prefix (4 bytes BE) + raw payload.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_SIZE: usize = 4;

/// Largest payload accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Encode a payload into a single frame: 4 bytes BE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = frame_len(payload, DEFAULT_MAX_FRAME_LEN)?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Vec<u8>, usize), WireError> {
    if bytes.len() < LEN_SIZE {
        return Err(WireError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > DEFAULT_MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len as usize));
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(WireError::NeedMore);
    }
    Ok((bytes[LEN_SIZE..LEN_SIZE + len].to_vec(), LEN_SIZE + len))
}

/// Read exactly one frame from `reader`, blocking until the length prefix and the
/// whole payload have arrived. A stream that ends early yields [`WireError::Disconnected`].
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| WireError::from_io(e, WireOp::ReadSize))?;
    let len = u32::from_be_bytes(len_buf);
    if len > max_len {
        return Err(WireError::TooLarge(len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| WireError::from_io(e, WireOp::ReadPayload))?;
    Ok(payload)
}

/// Write one frame to `writer` and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: u32) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = frame_len(payload, max_len)?;
    let write = async {
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    };
    write.await.map_err(|e| WireError::from_io(e, WireOp::Write))
}

fn frame_len(payload: &[u8], max_len: u32) -> Result<u32, WireError> {
    match u32::try_from(payload.len()) {
        Ok(len) if len <= max_len => Ok(len),
        _ => Err(WireError::TooLarge(payload.len())),
    }
}

/// Which framing step an I/O error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOp {
    ReadSize,
    ReadPayload,
    Write,
}

impl fmt::Display for WireOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireOp::ReadSize => f.write_str("read frame size"),
            WireOp::ReadPayload => f.write_str("read frame payload"),
            WireOp::Write => f.write_str("write frame"),
        }
    }
}

/// Error framing or unframing a payload.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Remote closed the stream (EOF, reset, broken pipe).
    #[error("disconnected")]
    Disconnected,
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("failed to {op}: {source}")]
    Io {
        op: WireOp,
        #[source]
        source: io::Error,
    },
}

impl WireError {
    fn from_io(err: io::Error, op: WireOp) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => WireError::Disconnected,
            _ => WireError::Io { op, source: err },
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, WireError::Disconnected)
    }
}
