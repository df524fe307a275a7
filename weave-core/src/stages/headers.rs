//! Carries message annotations across the wire.
//!
//! Frame: `[u32 BE header-len][u32 BE body-len][JSON annotations][body]`.

use async_trait::async_trait;

use crate::message::{Annotations, Message};
use crate::middleware::{Flow, Middleware};
use crate::peer::Peer;
use crate::pipe::{Direction, Pipe, PipeError};

const PREFIX_LEN: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct Headers;

#[async_trait]
impl Middleware for Headers {
    async fn execute(
        &self,
        _peer: &Peer,
        pipe: &mut Pipe<'_>,
        msg: &mut Message,
    ) -> Result<Flow, PipeError> {
        match pipe.direction() {
            Direction::Send => {
                let framed = wrap(msg.annotations(), msg.payload())?;
                msg.set_payload(framed);
            }
            Direction::Receive => {
                let (annotations, body) = unwrap(msg.payload())?;
                msg.annotations_mut().extend(annotations);
                msg.set_payload(body);
            }
        }
        Ok(Flow::Continue)
    }
}

pub fn wrap(annotations: &Annotations, body: &[u8]) -> Result<Vec<u8>, HeaderError> {
    let header = serde_json::to_vec(annotations)?;
    let header_len = u32::try_from(header.len()).map_err(|_| HeaderError::TooLarge)?;
    let body_len = u32::try_from(body.len()).map_err(|_| HeaderError::TooLarge)?;

    let mut out = Vec::with_capacity(PREFIX_LEN + header.len() + body.len());
    out.extend_from_slice(&header_len.to_be_bytes());
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a frame into annotations and body. Both lengths must account for
/// the frame exactly.
pub fn unwrap(frame: &[u8]) -> Result<(Annotations, Vec<u8>), HeaderError> {
    if frame.len() < PREFIX_LEN {
        return Err(HeaderError::Truncated { len: frame.len() });
    }
    let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body_len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    let expected = PREFIX_LEN as u64 + header_len as u64 + body_len as u64;
    if expected != frame.len() as u64 {
        return Err(HeaderError::LengthMismatch {
            expected,
            actual: frame.len(),
        });
    }
    let (header, body) = frame[PREFIX_LEN..].split_at(header_len);
    let annotations: Annotations = serde_json::from_slice(header)?;
    Ok((annotations, body.to_vec()))
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header frame truncated ({len} bytes)")]
    Truncated { len: usize },
    #[error("header frame length mismatch: prefixes say {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: usize },
    #[error("header or body too large")]
    TooLarge,
    #[error("annotations: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<HeaderError> for PipeError {
    fn from(err: HeaderError) -> Self {
        PipeError::stage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap() {
        let mut annotations = Annotations::new();
        annotations.insert("middleware.routes".into(), "chat".into());
        let framed = wrap(&annotations, b"body bytes").unwrap();

        let header_len = u32::from_be_bytes(framed[..4].try_into().unwrap()) as usize;
        let body_len = u32::from_be_bytes(framed[4..8].try_into().unwrap()) as usize;
        assert_eq!(body_len, 10);
        assert_eq!(framed.len(), PREFIX_LEN + header_len + body_len);

        let (decoded, body) = unwrap(&framed).unwrap();
        assert_eq!(decoded, annotations);
        assert_eq!(body, b"body bytes");
    }

    #[test]
    fn empty_annotations_and_body() {
        let framed = wrap(&Annotations::new(), b"").unwrap();
        assert_eq!(&framed[PREFIX_LEN..], b"{}");
        let (annotations, body) = unwrap(&framed).unwrap();
        assert!(annotations.is_empty());
        assert!(body.is_empty());
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(matches!(
            unwrap(b"\0\0\0"),
            Err(HeaderError::Truncated { len: 3 })
        ));

        let mut framed = wrap(&Annotations::new(), b"abc").unwrap();
        framed.push(b'!');
        assert!(matches!(
            unwrap(&framed),
            Err(HeaderError::LengthMismatch { .. })
        ));

        let mut bad_json = Vec::new();
        bad_json.extend_from_slice(&2u32.to_be_bytes());
        bad_json.extend_from_slice(&0u32.to_be_bytes());
        bad_json.extend_from_slice(b"[]");
        assert!(matches!(unwrap(&bad_json), Err(HeaderError::Json(_))));
    }
}
