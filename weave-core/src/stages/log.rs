use async_trait::async_trait;
use tracing::info;

use crate::message::Message;
use crate::middleware::{Flow, Middleware};
use crate::peer::Peer;
use crate::pipe::{Direction, Pipe, PipeError};

/// Logs every message passing through it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Log;

#[async_trait]
impl Middleware for Log {
    async fn execute(
        &self,
        peer: &Peer,
        pipe: &mut Pipe<'_>,
        msg: &mut Message,
    ) -> Result<Flow, PipeError> {
        let arrow = match pipe.direction() {
            Direction::Send => "out->",
            Direction::Receive => "<--in",
        };
        info!(
            target: "weave::traffic",
            local = peer.local_addr(),
            remote = peer.remote_addr(),
            len = msg.payload().len(),
            "{arrow}"
        );
        Ok(Flow::Continue)
    }
}
