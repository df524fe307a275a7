//! Pipeline traversal over a [`StageList`], with re-entrant interception.
//!
//! A [`Pipe`] covers the half-open position range `[from, to)`. Send runs its
//! stages ascending, Receive descending. While a stage executes, the pipe's
//! cursor equals that stage's position; [`Pipe::send`] and [`Pipe::receive`]
//! run a sub-pipe over the stages after it, `[cursor + 1, N + 1)`.

use std::error::Error as StdError;
use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::message::Message;
use crate::middleware::{Flow, StageList};
use crate::peer::Peer;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The peer was cancelled or its inbound stream ended.
    #[error("peer disconnected")]
    Disconnected,
    #[error("stage failed: {0}")]
    Stage(#[source] BoxError),
}

impl PipeError {
    pub fn stage(err: impl Into<BoxError>) -> Self {
        PipeError::Stage(err.into())
    }
}

/// The peer-side endpoints a pipe reads from and writes to. Owned by the
/// peer's dispatch task and lent to one traversal at a time.
pub(crate) struct PipeIo {
    pub(crate) inbound: mpsc::Receiver<Message>,
    wire: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl PipeIo {
    pub(crate) fn new(
        inbound: mpsc::Receiver<Message>,
        wire: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inbound,
            wire,
            cancel,
        }
    }

    async fn next_inbound(&mut self) -> Result<Message, PipeError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipeError::Disconnected),
            msg = self.inbound.recv() => msg.ok_or(PipeError::Disconnected),
        }
    }

    /// Queue a fully processed message for the send task.
    pub(crate) async fn write(&self, msg: Message) -> Result<(), PipeError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipeError::Disconnected),
            res = self.wire.send(msg) => res.map_err(|_| PipeError::Disconnected),
        }
    }
}

pub struct Pipe<'a> {
    peer: &'a Peer,
    stages: &'a StageList,
    io: &'a mut PipeIo,
    direction: Direction,
    from: usize,
    to: usize,
    cursor: usize,
}

impl<'a> Pipe<'a> {
    /// Panics if `[from, to)` is not a sub-range of `[1, stages.len() + 1)`.
    pub(crate) fn new(
        peer: &'a Peer,
        stages: &'a StageList,
        io: &'a mut PipeIo,
        direction: Direction,
        from: usize,
        to: usize,
    ) -> Self {
        let end = stages.len() + 1;
        assert!(
            from >= 1 && from <= to && to <= end,
            "invalid pipe range [{from}, {to}) over {} stages",
            stages.len()
        );
        let cursor = match direction {
            Direction::Send => from,
            Direction::Receive => to,
        };
        Self {
            peer,
            stages,
            io,
            direction,
            from,
            to,
            cursor,
        }
    }

    /// Pipe over every stage.
    pub(crate) fn full(
        peer: &'a Peer,
        stages: &'a StageList,
        io: &'a mut PipeIo,
        direction: Direction,
    ) -> Self {
        Self::new(peer, stages, io, direction, 1, stages.len() + 1)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Position of the executing stage.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn peer(&self) -> &'a Peer {
        self.peer
    }

    pub(crate) async fn process(&mut self, msg: &mut Message) -> Result<Flow, PipeError> {
        let stages = self.stages;
        let peer = self.peer;
        for stage in stages.select(self.from, self.to, self.direction) {
            let position = stage.position();
            if self.direction == Direction::Receive {
                self.cursor -= 1;
            }
            assert!(
                position >= self.from && position < self.to && position == self.cursor,
                "stage {stage} outside pipe range [{}, {}) at cursor {}",
                self.from,
                self.to,
                self.cursor
            );
            trace!(
                stage = stage.name(),
                position,
                direction = %self.direction,
                len = msg.payload().len(),
                "execute middleware"
            );
            match stage.execute(peer, self, msg).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => {
                    trace!(stage = stage.name(), position, "pipeline halted");
                    return Ok(Flow::Halt);
                }
                Err(err) => {
                    error!(
                        peer = %peer.id(),
                        stage = stage.name(),
                        position,
                        direction = %self.direction,
                        error = %err,
                        "middleware failed"
                    );
                    return Err(err);
                }
            }
            if self.direction == Direction::Send {
                self.cursor += 1;
            }
        }
        Ok(Flow::Continue)
    }

    fn remaining(&self) -> (usize, usize) {
        (self.cursor + 1, self.stages.len() + 1)
    }

    /// Run `msg` through the stages after the current one in Send direction,
    /// then queue it for the wire. A halting sub-pipe writes nothing.
    pub async fn send(&mut self, mut msg: Message) -> Result<Flow, PipeError> {
        let (from, to) = self.remaining();
        if from < to {
            let mut sub = Pipe::new(self.peer, self.stages, &mut *self.io, Direction::Send, from, to);
            if sub.process(&mut msg).await? == Flow::Halt {
                return Ok(Flow::Halt);
            }
        }
        self.io.write(msg).await?;
        Ok(Flow::Continue)
    }

    /// Wait for the next raw inbound message and run it through the stages
    /// after the current one in Receive direction. Messages halted there are
    /// consumed and the wait continues.
    pub async fn receive(&mut self) -> Result<Message, PipeError> {
        let (from, to) = self.remaining();
        loop {
            let mut msg = self.io.next_inbound().await?;
            if from == to {
                return Ok(msg);
            }
            let mut sub = Pipe::new(
                self.peer,
                self.stages,
                &mut *self.io,
                Direction::Receive,
                from,
                to,
            );
            match sub.process(&mut msg).await? {
                Flow::Continue => return Ok(msg),
                Flow::Halt => debug!(peer = %self.peer.id(), "intercepted message halted, waiting for next"),
            }
        }
    }
}

impl fmt::Debug for Pipe<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("peer", &self.peer.id())
            .field("direction", &self.direction)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("cursor", &self.cursor)
            .finish()
    }
}
