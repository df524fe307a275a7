//! Messages carried through the pipeline: payload bytes plus annotations.

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

/// Process-local message identifier. Never put on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// String-keyed metadata attached to a message. Serialized by the headers stage.
pub type Annotations = HashMap<String, String>;

/// A p2p message. Stages rewrite payload and annotations in place.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    payload: Vec<u8>,
    annotations: Annotations,
}

impl Message {
    /// Empty message with a fresh id.
    pub fn new() -> Self {
        Self::from_payload(Vec::new())
    }

    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self {
            id: MessageId::new(),
            payload,
            annotations: Annotations::new(),
        }
    }

    pub fn from_string(data: impl Into<String>) -> Self {
        Self::from_payload(data.into().into_bytes())
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Payload decoded as UTF-8, lossy. Empty payload gives an empty string.
    pub fn payload_string(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn set_payload_string(&mut self, value: impl Into<String>) {
        self.payload = value.into().into_bytes();
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    /// Builder-style annotation setter.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Message::from_payload(payload)
    }
}

impl From<&[u8]> for Message {
    fn from(payload: &[u8]) -> Self {
        Message::from_payload(payload.to_vec())
    }
}

impl From<&str> for Message {
    fn from(data: &str) -> Self {
        Message::from_string(data)
    }
}
