//! Path-based message routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use crate::message::Message;
use crate::middleware::{Flow, Middleware};
use crate::peer::Peer;
use crate::pipe::{Direction, Pipe, PipeError};

/// Annotation naming the route of a message.
pub const ROUTE_ANNOTATION: &str = "middleware.routes";

pub type RouteHandler = Arc<dyn Fn(Peer, Message) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, RouteHandler>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn route<F>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Peer, Message) + Send + Sync + 'static,
    {
        self.insert(path, handler);
        self
    }

    pub fn insert<F>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(Peer, Message) + Send + Sync + 'static,
    {
        self.routes.insert(path.into(), Arc::new(handler));
    }

    pub fn get(&self, path: &str) -> Option<&RouteHandler> {
        self.routes.get(path)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.routes.keys()).finish()
    }
}

/// Message annotated for `path`.
pub fn routed_message(path: &str, payload: impl Into<Vec<u8>>) -> Message {
    Message::from_payload(payload.into()).with_annotation(ROUTE_ANNOTATION, path)
}

/// Hands routed inbound messages to their handler on a spawned task.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    table: RoutingTable,
}

impl Routes {
    pub fn new(table: RoutingTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Middleware for Routes {
    async fn execute(
        &self,
        peer: &Peer,
        pipe: &mut Pipe<'_>,
        msg: &mut Message,
    ) -> Result<Flow, PipeError> {
        if pipe.direction() == Direction::Send {
            return Ok(Flow::Continue);
        }
        let Some(path) = msg.annotations().get(ROUTE_ANNOTATION).cloned() else {
            trace!(peer = %peer.id(), "no route annotation");
            return Ok(Flow::Continue);
        };
        match self.table.get(&path) {
            Some(handler) => {
                let handler = handler.clone();
                let peer = peer.clone();
                let msg = msg.clone();
                tokio::spawn(async move { handler(peer, msg) });
            }
            None => warn!(peer = %peer.id(), route = %path, "no handler for route"),
        }
        Ok(Flow::Continue)
    }
}
